//! Per-request protocol driver.
//!
//! One request is executed against one ready worker over three loopback
//! connections: request data in, metadata record out, and (when the worker
//! parses content) extracted content out. All three legs run concurrently
//! under a single absolute deadline; the byte cap governs the content leg
//! only and must never hold up the metadata leg.

use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ParseError, Result};
use crate::metadata::Metadata;
use crate::protocol::{self, WorkerPorts};

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 20;
pub const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// What to do when the metadata stream reaches EOF without a complete
/// record, which is how a mid-parse worker death presents itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CrashPolicy {
    /// Return an empty record flagged as a parse failure. Content may have
    /// streamed successfully before the crash, so the call still succeeds.
    #[default]
    SynthesizeEmpty,
    /// Raise `ParseError::WorkerCrash`.
    Propagate,
}

pub struct ParseRequest<R, W> {
    pub base_uri: String,
    pub content_type: String,
    pub source: R,
    pub sink: W,
    pub abort_after_ms: u64,
    pub max_bytes_to_parse: u64,
    pub want_content: bool,
}

#[derive(Debug)]
pub struct ParseOutcome {
    pub metadata: Metadata,
    /// The content stream was cut off at the byte cap.
    pub truncated: bool,
    /// The metadata record was synthesized after a worker crash.
    pub worker_crashed: bool,
    pub content_bytes: u64,
}

pub struct ParseRunner {
    crash_policy: CrashPolicy,
    connect_attempts: u32,
    connect_retry_delay: Duration,
}

impl ParseRunner {
    pub fn new(crash_policy: CrashPolicy) -> Self {
        Self {
            crash_policy,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_retry_delay: DEFAULT_CONNECT_RETRY_DELAY,
        }
    }

    pub fn with_connect_backoff(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_retry_delay = delay;
        self
    }

    /// Drives one request to completion or to the deadline. On
    /// `ParseError::Timeout` (and on any hard failure) the worker's
    /// protocol state can no longer be trusted and the caller must discard
    /// it instead of reusing it.
    pub async fn run<R, W>(
        &self,
        ports: &WorkerPorts,
        request: ParseRequest<R, W>,
    ) -> Result<ParseOutcome>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let ParseRequest {
            base_uri,
            content_type,
            mut source,
            mut sink,
            abort_after_ms,
            max_bytes_to_parse,
            want_content,
        } = request;
        let abort_after = Duration::from_millis(abort_after_ms);
        let deadline = tokio::time::Instant::now() + abort_after;

        let write_leg = self.send_input(ports.data_in, &base_uri, &content_type, &mut source);
        let metadata_leg = self.read_metadata(ports.metadata_out, &base_uri);
        let content_leg =
            self.read_content(ports.content_out, &mut sink, max_bytes_to_parse, want_content);

        let legs = async { tokio::join!(write_leg, metadata_leg, content_leg) };
        match tokio::time::timeout_at(deadline, legs).await {
            Ok((write_result, metadata_result, content_result)) => {
                write_result?;
                let (content_bytes, truncated) = content_result?;
                let (metadata, worker_crashed) = metadata_result?;
                Ok(ParseOutcome {
                    metadata,
                    truncated,
                    worker_crashed,
                    content_bytes,
                })
            }
            Err(_) => {
                tracing::warn!("Parse of {} timed out after {:?}", base_uri, abort_after);
                Err(ParseError::Timeout(abort_after).into())
            }
        }
    }

    async fn connect(&self, port: u16) -> std::result::Result<TcpStream, ParseError> {
        protocol::connect_retry(port, self.connect_attempts, self.connect_retry_delay)
            .await
            .map_err(|e| ParseError::WorkerCrash(format!("could not connect to port {port}: {e}")))
    }

    /// The data-in leg. Any failure here is a hard failure of the call.
    async fn send_input<R>(
        &self,
        port: u16,
        base_uri: &str,
        content_type: &str,
        source: &mut R,
    ) -> std::result::Result<(), ParseError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut stream = self.connect(port).await?;
        let hard =
            |e: std::io::Error| ParseError::WorkerCrash(format!("failed to send input: {e}"));
        protocol::write_request_header(&mut stream, base_uri, content_type)
            .await
            .map_err(hard)?;
        tokio::io::copy(source, &mut stream).await.map_err(hard)?;
        // Closing the write side is the EOF the worker parses against.
        stream.shutdown().await.map_err(hard)?;
        Ok(())
    }

    /// The metadata leg: one EOF-terminated JSON record. EOF without a
    /// complete record is a worker crash, handled per `CrashPolicy`.
    async fn read_metadata(
        &self,
        port: u16,
        base_uri: &str,
    ) -> std::result::Result<(Metadata, bool), ParseError> {
        let mut stream = self.connect(port).await?;
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            let n = stream.read_buf(&mut buf).await.map_err(|e| {
                ParseError::WorkerCrash(format!("failed to read metadata record: {e}"))
            })?;
            if n == 0 {
                break;
            }
        }
        match serde_json::from_slice::<Metadata>(&buf) {
            Ok(metadata) if !buf.is_empty() => Ok((metadata, false)),
            _ => match self.crash_policy {
                CrashPolicy::SynthesizeEmpty => {
                    tracing::warn!(
                        "Worker delivered no metadata record for {}, synthesizing an empty one",
                        base_uri
                    );
                    Ok((Metadata::parse_failure(), true))
                }
                CrashPolicy::Propagate => Err(ParseError::WorkerCrash(format!(
                    "metadata stream for {base_uri} ended before a complete record"
                ))),
            },
        }
    }

    /// The content leg. Stops at EOF or at the byte cap; on cap the socket
    /// is dropped at once rather than draining the worker's remainder.
    async fn read_content<W>(
        &self,
        port: Option<u16>,
        sink: &mut W,
        cap: u64,
        want_content: bool,
    ) -> std::result::Result<(u64, bool), ParseError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(port) = port else {
            return Ok((0, false));
        };
        let mut stream = self.connect(port).await?;
        let hard =
            |e: std::io::Error| ParseError::WorkerCrash(format!("failed to read content: {e}"));
        if !want_content {
            // Drain so the worker can complete its request cycle.
            let mut discard = tokio::io::sink();
            tokio::io::copy(&mut stream, &mut discard)
                .await
                .map_err(hard)?;
            return Ok((0, false));
        }

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let remaining = cap - written;
            if remaining == 0 {
                // One probe read distinguishes "exactly the cap" from a
                // stream that still had bytes to deliver.
                let n = stream.read(&mut buf).await.map_err(hard)?;
                sink.flush().await.map_err(hard)?;
                return Ok((written, n > 0));
            }
            let want = remaining.min(buf.len() as u64) as usize;
            let n = stream.read(&mut buf[..want]).await.map_err(hard)?;
            if n == 0 {
                sink.flush().await.map_err(hard)?;
                return Ok((written, false));
            }
            sink.write_all(&buf[..n]).await.map_err(hard)?;
            written += n as u64;
        }
    }
}
