//! The `key=value` payload file handed to a worker at spawn.
//!
//! Worker settings travel through a scratch file rather than the command
//! line, so arbitrary option values can never be injected into the spawn
//! arguments. The format is plain text, one `key=value` per line; blank
//! lines and `#` comments are skipped on read.

use std::path::Path;

/// Well-known payload keys.
pub mod keys {
    pub const RUN_UUID: &str = "runUuid";
    pub const PARSE_CONTENT: &str = "parseContent";
    pub const PARSER: &str = "parser";
    pub const ZIP_BOMB_COMPRESSION_RATIO: &str = "zipBombCompressionRatio";
    pub const ZIP_BOMB_MAX_DEPTH: &str = "zipBombMaxDepth";
    pub const ZIP_BOMB_MAX_PACKAGE_ENTRY_DEPTH: &str = "zipBombMaxPackageEntryDepth";
    pub const EXTRACT_HTML_LINKS: &str = "extractHtmlLinks";
    pub const INCLUDE_IMAGES: &str = "includeImages";
    pub const BASE_URI: &str = "baseUri";
    pub const CONTENT_TYPE: &str = "contentType";
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    pub fn parse(text: &str) -> Self {
        let mut props = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                props.set(key.trim(), value.trim());
            }
        }
        props
    }

    pub async fn store(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::write(path, self.render()).await
    }

    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(Self::parse(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_and_parses_round_trip() {
        let mut props = Properties::new();
        props.set(keys::RUN_UUID, "abc-123");
        props.set(keys::PARSE_CONTENT, "true");
        props.set(keys::ZIP_BOMB_MAX_DEPTH, "200");

        let parsed = Properties::parse(&props.render());
        assert_eq!(parsed, props);
        assert_eq!(parsed.get(keys::RUN_UUID), Some("abc-123"));
        assert!(parsed.get_bool(keys::PARSE_CONTENT, false));
        assert_eq!(parsed.get_u32(keys::ZIP_BOMB_MAX_DEPTH, 0), 200);
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let props = Properties::parse("# header\n\nparseContent=false\n  extractHtmlLinks = true \n");
        assert_eq!(props.get(keys::PARSE_CONTENT), Some("false"));
        assert!(props.get_bool(keys::EXTRACT_HTML_LINKS, false));
        assert_eq!(props.get("missing"), None);
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut props = Properties::new();
        props.set("a", "1");
        props.set("a", "2");
        assert_eq!(props.get("a"), Some("2"));
        assert_eq!(props.render(), "a=2\n");
    }
}
