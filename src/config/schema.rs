use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pool::PoolConfig;
use crate::protocol::properties::{keys, Properties};
use crate::reaper::ReaperConfig;
use crate::runner::CrashPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkparseConfig {
    /// Shared scratch directory for config payloads and ports files.
    #[serde(default = "default_work_directory")]
    pub work_directory_path: PathBuf,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub parser: ParserProps,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub crash_policy: CrashPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Worker runtime executable, resolved once here rather than through
    /// any process-wide lookup.
    pub runtime_path: PathBuf,
    /// Emitted as an `-Xmx<n>m`-style flag when set.
    #[serde(default)]
    pub heap_limit_mb: Option<u32>,
    /// Arguments ahead of the worker's own flags: a classpath or module
    /// spec plus entry point for VM runtimes, empty for a plain binary.
    #[serde(default)]
    pub launch_args: Vec<String>,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
}

fn default_work_directory() -> PathBuf {
    std::env::temp_dir().join("forkparse")
}

fn default_ready_timeout() -> u64 {
    120_000
}

/// Settings forwarded opaquely to the parser inside the worker. The zip
/// bomb limits are the worker's own decompression defense, independent of
/// the caller's byte cap.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserProps {
    #[serde(default = "default_parse_content")]
    pub parse_content: bool,
    #[serde(default = "default_parser")]
    pub parser: String,
    #[serde(default = "default_zip_bomb_compression_ratio")]
    pub zip_bomb_compression_ratio: u32,
    #[serde(default = "default_zip_bomb_max_depth")]
    pub zip_bomb_max_depth: u32,
    #[serde(default = "default_zip_bomb_max_package_entry_depth")]
    pub zip_bomb_max_package_entry_depth: u32,
    #[serde(default)]
    pub extract_html_links: bool,
    #[serde(default)]
    pub include_images: bool,
}

fn default_parse_content() -> bool {
    true
}

fn default_parser() -> String {
    "plain".to_string()
}

fn default_zip_bomb_compression_ratio() -> u32 {
    200
}

fn default_zip_bomb_max_depth() -> u32 {
    200
}

fn default_zip_bomb_max_package_entry_depth() -> u32 {
    20
}

impl Default for ParserProps {
    fn default() -> Self {
        Self {
            parse_content: default_parse_content(),
            parser: default_parser(),
            zip_bomb_compression_ratio: default_zip_bomb_compression_ratio(),
            zip_bomb_max_depth: default_zip_bomb_max_depth(),
            zip_bomb_max_package_entry_depth: default_zip_bomb_max_package_entry_depth(),
            extract_html_links: false,
            include_images: false,
        }
    }
}

impl ParserProps {
    /// The `key=value` payload written for each spawned worker. The run
    /// uuid is appended at spawn time.
    pub fn to_properties(&self) -> Properties {
        let mut props = Properties::new();
        props.set(keys::PARSE_CONTENT, self.parse_content.to_string());
        props.set(keys::PARSER, self.parser.clone());
        props.set(
            keys::ZIP_BOMB_COMPRESSION_RATIO,
            self.zip_bomb_compression_ratio.to_string(),
        );
        props.set(keys::ZIP_BOMB_MAX_DEPTH, self.zip_bomb_max_depth.to_string());
        props.set(
            keys::ZIP_BOMB_MAX_PACKAGE_ENTRY_DEPTH,
            self.zip_bomb_max_package_entry_depth.to_string(),
        );
        props.set(
            keys::EXTRACT_HTML_LINKS,
            self.extract_html_links.to_string(),
        );
        props.set(keys::INCLUDE_IMAGES, self.include_images.to_string());
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_props_payload_carries_every_knob() {
        let props = ParserProps::default().to_properties();
        assert_eq!(props.get(keys::PARSE_CONTENT), Some("true"));
        assert_eq!(props.get(keys::PARSER), Some("plain"));
        assert_eq!(props.get(keys::ZIP_BOMB_COMPRESSION_RATIO), Some("200"));
        assert_eq!(props.get(keys::ZIP_BOMB_MAX_DEPTH), Some("200"));
        assert_eq!(props.get(keys::ZIP_BOMB_MAX_PACKAGE_ENTRY_DEPTH), Some("20"));
        assert_eq!(props.get(keys::EXTRACT_HTML_LINKS), Some("false"));
        assert_eq!(props.get(keys::INCLUDE_IMAGES), Some("false"));
        // The run uuid is per spawn, not part of the shared payload.
        assert_eq!(props.get(keys::RUN_UUID), None);
    }
}
