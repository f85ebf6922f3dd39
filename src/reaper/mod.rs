//! Janitor for worker scratch files left behind in the shared work
//! directory, e.g. by a host that was killed before its pool could clean
//! up. Only files matching the worker temp-file naming convention are
//! touched; everything else in the directory is left alone.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::TEMP_FILE_PREFIX;
use crate::schedule::PeriodicTask;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaperConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_file_age")]
    pub max_file_age_ms: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_max_file_age() -> u64 {
    2 * 60 * 60 * 1000
}

fn default_initial_delay() -> u64 {
    5 * 60 * 1000
}

fn default_sweep_interval() -> u64 {
    10 * 60 * 1000
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_file_age_ms: default_max_file_age(),
            initial_delay_ms: default_initial_delay(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

pub struct TempFileReaperService {
    task: PeriodicTask,
}

impl TempFileReaperService {
    pub fn start(work_dir: PathBuf, config: &ReaperConfig) -> Self {
        let max_age = Duration::from_millis(config.max_file_age_ms);
        let task = PeriodicTask::spawn(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.sweep_interval_ms),
            move || {
                let work_dir = work_dir.clone();
                async move {
                    let deleted = sweep_once(&work_dir, max_age).await;
                    if deleted > 0 {
                        tracing::info!(
                            "Temp reaper removed {} stale file(s) from {}",
                            deleted,
                            work_dir.display()
                        );
                    }
                }
            },
        );
        Self { task }
    }

    pub fn close(&self) {
        self.task.cancel();
    }
}

/// One sweep: best-effort deletes every plain file in `work_dir` whose
/// name carries the worker temp prefix and whose mtime is older than
/// `max_age`. Returns the number of files removed.
pub async fn sweep_once(work_dir: &Path, max_age: Duration) -> usize {
    let mut read_dir = match tokio::fs::read_dir(work_dir).await {
        Ok(read_dir) => read_dir,
        Err(e) => {
            tracing::debug!("Temp reaper could not list {}: {}", work_dir.display(), e);
            return 0;
        }
    };
    let mut deleted = 0;
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        if !entry
            .file_name()
            .to_string_lossy()
            .starts_with(TEMP_FILE_PREFIX)
        {
            continue;
        }
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        if !is_older_than(&entry, max_age).await {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                tracing::debug!("Temp reaper deleted {}", entry.path().display());
                deleted += 1;
            }
            Err(e) => {
                tracing::debug!(
                    "Ignoring failure deleting {}: {}",
                    entry.path().display(),
                    e
                );
            }
        }
    }
    deleted
}

async fn is_older_than(entry: &tokio::fs::DirEntry, max_age: Duration) -> bool {
    let Ok(meta) = entry.metadata().await else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match modified.elapsed() {
        Ok(age) => age > max_age,
        // Clock skew puts the mtime in the future; leave the file alone.
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, b"scratch").await.unwrap();
        path
    }

    #[tokio::test]
    async fn deletes_only_old_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = touch(dir.path(), "tikafork-config-dead.properties").await;
        let unrelated = touch(dir.path(), "keep-me.txt").await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let deleted = sweep_once(dir.path(), Duration::from_millis(50)).await;

        assert_eq!(deleted, 1);
        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn young_files_survive_a_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let young = touch(dir.path(), "tikafork-ports-live.properties").await;

        let deleted = sweep_once(dir.path(), Duration::from_secs(3600)).await;

        assert_eq!(deleted, 0);
        assert!(young.exists());
    }

    #[tokio::test]
    async fn missing_directory_is_harmless() {
        let deleted = sweep_once(Path::new("/nonexistent/forkparse-test"), Duration::ZERO).await;
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn service_sweeps_on_its_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let stale = touch(dir.path(), "tikafork-config-old.properties").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let service = TempFileReaperService::start(
            dir.path().to_path_buf(),
            &ReaperConfig {
                enabled: true,
                max_file_age_ms: 50,
                initial_delay_ms: 0,
                sweep_interval_ms: 60_000,
            },
        );

        // First sweep runs right after the zero initial delay.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!stale.exists());
        service.close();
    }
}
