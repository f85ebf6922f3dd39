//! The pluggable parse function a worker runs, plus the reference
//! implementations shipped with the worker binary. Real format-aware
//! parsers plug in behind the same trait and carry their own
//! decompression-bomb defenses; the limits here are plain data handed to
//! them.

use async_trait::async_trait;

use crate::error::{ParseError, Result};
use crate::metadata::{self, Metadata};
use crate::protocol::properties::{keys, Properties};

/// Worker-internal decompression defense knobs, independent of the
/// caller's byte cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    pub compression_ratio: u32,
    pub max_depth: u32,
    pub max_package_entry_depth: u32,
}

#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub limits: ParserLimits,
    pub extract_html_links: bool,
    pub include_images: bool,
}

impl ParserOptions {
    pub fn from_properties(props: &Properties) -> Self {
        Self {
            limits: ParserLimits {
                compression_ratio: props.get_u32(keys::ZIP_BOMB_COMPRESSION_RATIO, 200),
                max_depth: props.get_u32(keys::ZIP_BOMB_MAX_DEPTH, 200),
                max_package_entry_depth: props.get_u32(keys::ZIP_BOMB_MAX_PACKAGE_ENTRY_DEPTH, 20),
            },
            extract_html_links: props.get_bool(keys::EXTRACT_HTML_LINKS, false),
            include_images: props.get_bool(keys::INCLUDE_IMAGES, false),
        }
    }
}

pub struct ParsedDocument {
    pub metadata: Metadata,
    pub content: Vec<u8>,
}

#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(
        &self,
        base_uri: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<ParsedDocument>;
}

/// Passthrough parser: echoes the body as extracted content and reports
/// basic shape metadata.
pub struct PlainTextParser {
    options: ParserOptions,
}

impl PlainTextParser {
    pub fn new(options: ParserOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Parser for PlainTextParser {
    async fn parse(
        &self,
        base_uri: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<ParsedDocument> {
        let mut record = Metadata::new();
        record.set(
            metadata::CONTENT_TYPE,
            if content_type.is_empty() {
                "text/plain"
            } else {
                content_type
            },
        );
        record.set(metadata::RESOURCE_NAME, base_uri);
        record.set(metadata::CONTENT_LENGTH, body.len().to_string());
        record.set("X-Parsed-By", "PlainTextParser");
        if self.options.extract_html_links {
            for link in extract_links(body) {
                record.add("X-Parsed-Link", link);
            }
        }
        Ok(ParsedDocument {
            metadata: record,
            content: body.to_vec(),
        })
    }
}

/// Pulls `href="..."` targets out of markup-ish input.
fn extract_links(body: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(body);
    let mut links = Vec::new();
    let mut rest = text.as_ref();
    while let Some(start) = rest.find("href=\"") {
        rest = &rest[start + 6..];
        let Some(end) = rest.find('"') else {
            break;
        };
        if end > 0 {
            links.push(rest[..end].to_string());
        }
        rest = &rest[end + 1..];
    }
    links
}

/// Fault-injection parser: never completes. Lets deployments exercise the
/// caller's deadline handling end to end.
pub struct HangParser;

#[async_trait]
impl Parser for HangParser {
    async fn parse(&self, _: &str, _: &str, _: &[u8]) -> Result<ParsedDocument> {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
    }
}

/// Fault-injection parser: kills the worker process mid-request, the way
/// an OOM kill would.
pub struct CrashParser;

#[async_trait]
impl Parser for CrashParser {
    async fn parse(&self, _: &str, _: &str, _: &[u8]) -> Result<ParsedDocument> {
        tracing::warn!("Crash parser invoked, exiting");
        std::process::exit(137);
    }
}

/// Parser selection from the worker's payload file.
pub fn parser_from_properties(props: &Properties) -> std::result::Result<Box<dyn Parser>, ParseError> {
    match props.get(keys::PARSER).unwrap_or("plain") {
        "plain" => Ok(Box::new(PlainTextParser::new(ParserOptions::from_properties(
            props,
        )))),
        "hang" => Ok(Box::new(HangParser)),
        "crash" => Ok(Box::new(CrashParser)),
        other => Err(ParseError::WorkerCrash(format!("unknown parser: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_parser_reports_shape_metadata() {
        let parser = PlainTextParser::new(ParserOptions::from_properties(&Properties::new()));
        let doc = parser
            .parse("file:///tmp/a.txt", "", b"hello\nworld\n")
            .await
            .unwrap();
        assert_eq!(doc.metadata.get(metadata::CONTENT_TYPE), Some("text/plain"));
        assert_eq!(doc.metadata.get(metadata::CONTENT_LENGTH), Some("12"));
        assert_eq!(doc.metadata.get(metadata::RESOURCE_NAME), Some("file:///tmp/a.txt"));
        assert_eq!(doc.content, b"hello\nworld\n");
    }

    #[tokio::test]
    async fn content_type_hint_is_echoed() {
        let parser = PlainTextParser::new(ParserOptions::from_properties(&Properties::new()));
        let doc = parser
            .parse("file:///tmp/a.html", "text/html", b"<p>hi</p>")
            .await
            .unwrap();
        assert_eq!(doc.metadata.get(metadata::CONTENT_TYPE), Some("text/html"));
    }

    #[test]
    fn selection_honors_the_payload_and_rejects_unknowns() {
        let mut props = Properties::new();
        assert!(parser_from_properties(&props).is_ok());
        props.set(keys::PARSER, "hang");
        assert!(parser_from_properties(&props).is_ok());
        props.set(keys::PARSER, "no-such-parser");
        assert!(parser_from_properties(&props).is_err());
    }

    #[tokio::test]
    async fn link_extraction_is_opt_in() {
        let body = br#"<a href="https://example.com/a">a</a> <a href="/b">b</a>"#;

        let off = PlainTextParser::new(ParserOptions::from_properties(&Properties::new()));
        let doc = off.parse("file:///x.html", "text/html", body).await.unwrap();
        assert!(doc.metadata.values("X-Parsed-Link").is_empty());

        let mut props = Properties::new();
        props.set(keys::EXTRACT_HTML_LINKS, "true");
        let on = PlainTextParser::new(ParserOptions::from_properties(&props));
        let doc = on.parse("file:///x.html", "text/html", body).await.unwrap();
        assert_eq!(
            doc.metadata.values("X-Parsed-Link"),
            &["https://example.com/a", "/b"]
        );
    }

    #[test]
    fn options_come_from_the_payload() {
        let mut props = Properties::new();
        props.set(keys::ZIP_BOMB_COMPRESSION_RATIO, "50");
        props.set(keys::EXTRACT_HTML_LINKS, "true");
        let options = ParserOptions::from_properties(&props);
        assert_eq!(options.limits.compression_ratio, 50);
        assert_eq!(options.limits.max_depth, 200);
        assert!(options.extract_html_links);
    }
}
