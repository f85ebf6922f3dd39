use std::path::Path;

use figment::providers::{Env, Format, Json, Toml};
use figment::Figment;

use crate::error::{ConfigError, Result};

use super::schema::ForkparseConfig;

/// Loads configuration from the conventional files in the working
/// directory, overridden by `FORKPARSE_`-prefixed environment variables.
pub fn load_from_env_or_file() -> Result<ForkparseConfig> {
    let config: ForkparseConfig = Figment::new()
        .merge(Toml::file("forkparse.toml"))
        .merge(Json::file("forkparse.json"))
        .merge(env_provider())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

pub fn load_from_path(path: &Path) -> Result<ForkparseConfig> {
    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Figment::new().merge(Json::file(path)),
        _ => Figment::new().merge(Toml::file(path)),
    };
    let config: ForkparseConfig = figment
        .merge(env_provider())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Environment overrides: `__` separates nesting levels and snake case
/// within a level maps onto the camelCase config keys, e.g.
/// `FORKPARSE_POOL__MAX_TOTAL=4` sets `pool.maxTotal`.
fn env_provider() -> Env {
    Env::prefixed("FORKPARSE_")
        .map(|key| {
            key.as_str()
                .to_ascii_lowercase()
                .split("__")
                .map(camel_case)
                .collect::<Vec<_>>()
                .join(".")
                .into()
        })
        .split(".")
}

fn camel_case(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (i, word) in segment.split('_').enumerate() {
        if i == 0 {
            out.push_str(word);
        } else {
            let mut chars = word.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.extend(chars);
            }
        }
    }
    out
}

pub fn validate(config: &ForkparseConfig) -> Result<()> {
    if config.worker.runtime_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("worker.runtimePath must be set".into()).into());
    }
    if config.pool.max_total == 0 {
        return Err(ConfigError::Validation("pool.maxTotal must be at least 1".into()).into());
    }
    if config.pool.min_idle > config.pool.max_total {
        return Err(
            ConfigError::Validation("pool.minIdle cannot exceed pool.maxTotal".into()).into(),
        );
    }
    if config.reaper.enabled && config.reaper.sweep_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "reaper.sweepIntervalMs must be positive when the reaper is enabled".into(),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::error::ForkparseError;
    use std::io::Write;
    use std::path::PathBuf;

    fn minimal_config() -> ForkparseConfig {
        ForkparseConfig {
            work_directory_path: PathBuf::from("/tmp/forkparse-test"),
            worker: WorkerConfig {
                runtime_path: PathBuf::from("/usr/bin/forkparse-worker"),
                heap_limit_mb: None,
                launch_args: vec![],
                ready_timeout_ms: 1_000,
            },
            pool: Default::default(),
            parser: Default::default(),
            reaper: Default::default(),
            crash_policy: Default::default(),
        }
    }

    #[test]
    fn loads_toml_with_defaults_filled_in() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
workDirectoryPath = "/var/tmp/forkparse"

[worker]
runtimePath = "/opt/parser/bin/worker"
heapLimitMb = 512

[pool]
maxTotal = 4
maxWaitMs = 30000
"#
        )
        .unwrap();

        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.worker.heap_limit_mb, Some(512));
        assert_eq!(config.pool.max_total, 4);
        assert_eq!(config.pool.max_wait_ms, Some(30_000));
        // Untouched sections come from defaults.
        assert!(config.pool.block_when_exhausted);
        assert!(config.parser.parse_content);
        assert!(config.reaper.enabled);
    }

    #[test]
    fn env_overrides_reach_camel_case_keys() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("FORKPARSE_WORKER__RUNTIME_PATH", "/opt/parser/bin/worker");
            jail.set_env("FORKPARSE_POOL__MAX_TOTAL", "3");
            jail.set_env("FORKPARSE_WORK_DIRECTORY_PATH", "/var/tmp/forkparse-env");

            let config = load_from_env_or_file().expect("env-only config loads");
            assert_eq!(
                config.worker.runtime_path,
                PathBuf::from("/opt/parser/bin/worker")
            );
            assert_eq!(config.pool.max_total, 3);
            assert_eq!(
                config.work_directory_path,
                PathBuf::from("/var/tmp/forkparse-env")
            );
            Ok(())
        });
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = minimal_config();
        config.pool.max_total = 0;
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, ForkparseError::Config(_)));
    }

    #[test]
    fn validate_rejects_min_idle_above_max_total() {
        let mut config = minimal_config();
        config.pool.max_total = 2;
        config.pool.min_idle = 3;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(validate(&minimal_config()).is_ok());
    }
}
