//! Ordered parse-metadata multimap.
//!
//! Parsers report an open-ended set of named values (content type, page
//! counts, author fields, ...). Insertion order is preserved so the record
//! that crosses the wire reads back exactly as the parser built it.

use serde::{Deserialize, Serialize};

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const RESOURCE_NAME: &str = "resourceName";

/// Set on a synthesized record when the worker died before producing one.
pub const PARSE_FAILURE: &str = "X-Parse-Failure";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: Vec<MetadataEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEntry {
    pub name: String,
    pub values: Vec<String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty record flagged as a parse failure, used in place of
    /// metadata a crashed worker never delivered.
    pub fn parse_failure() -> Self {
        let mut metadata = Self::new();
        metadata.set(PARSE_FAILURE, "true");
        metadata
    }

    /// Replaces all values under `name` with the single `value`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.values = vec![value],
            None => self.entries.push(MetadataEntry {
                name: name.to_string(),
                values: vec![value],
            }),
        }
    }

    /// Appends `value` under `name`, keeping any existing values.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.values.push(value),
            None => self.entries.push(MetadataEntry {
                name: name.to_string(),
                values: vec![value],
            }),
        }
    }

    /// First value under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.values.first())
            .map(String::as_str)
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.values.as_slice())
            .unwrap_or(&[])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_parse_failure(&self) -> bool {
        self.get(PARSE_FAILURE) == Some("true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_and_add_appends() {
        let mut metadata = Metadata::new();
        metadata.set(CONTENT_TYPE, "text/plain");
        metadata.set(CONTENT_TYPE, "text/html");
        assert_eq!(metadata.get(CONTENT_TYPE), Some("text/html"));
        assert_eq!(metadata.values(CONTENT_TYPE).len(), 1);

        metadata.add("X-Link", "a");
        metadata.add("X-Link", "b");
        assert_eq!(metadata.values("X-Link"), &["a", "b"]);
    }

    #[test]
    fn preserves_insertion_order_through_json() {
        let mut metadata = Metadata::new();
        metadata.set("zebra", "1");
        metadata.set("apple", "2");
        metadata.add("zebra", "3");

        let json = serde_json::to_string(&metadata).unwrap();
        let decoded: Metadata = serde_json::from_str(&json).unwrap();
        let names: Vec<_> = decoded.names().collect();
        assert_eq!(names, vec!["zebra", "apple"]);
        assert_eq!(decoded.values("zebra"), &["1", "3"]);
    }

    #[test]
    fn parse_failure_record_is_flagged() {
        let metadata = Metadata::parse_failure();
        assert!(metadata.is_parse_failure());
        assert_eq!(metadata.len(), 1);
        assert!(!Metadata::new().is_parse_failure());
    }
}
