//! Wire formats and handshake artifacts shared by both sides of a fork.
//!
//! A worker exposes three loopback listeners per its configuration: one for
//! request data in, one for the metadata record out, and optionally one for
//! extracted content out. The only startup handshake is the ports file the
//! worker writes once all of its listeners are bound.

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub mod properties;

pub use properties::Properties;

/// On-disk naming convention for per-worker scratch files. Kept verbatim
/// from the established deployments: external tooling (container health
/// checks, the temp reaper) keys off these prefixes.
pub const TEMP_FILE_PREFIX: &str = "tikafork-";
pub const PORTS_FILE_PREFIX: &str = "tikafork-ports-";
pub const CONFIG_FILE_PREFIX: &str = "tikafork-config-";

/// Lines a worker writes to stdout/stderr are dropped by the host unless
/// they start with this marker.
pub const LOG_MARKER: &str = "FORKPARSE";

const MAX_HEADER_LINE: usize = 64 * 1024;

pub fn ports_file_path(work_dir: &Path, run_uuid: &str) -> PathBuf {
    work_dir.join(format!("{PORTS_FILE_PREFIX}{run_uuid}.properties"))
}

pub fn config_file_path(work_dir: &Path, run_uuid: &str) -> PathBuf {
    work_dir.join(format!("{CONFIG_FILE_PREFIX}{run_uuid}.properties"))
}

/// The listening ports of one ready worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPorts {
    pub data_in: u16,
    pub metadata_out: u16,
    pub content_out: Option<u16>,
}

/// Reads the ports file, tolerantly: a missing, partially written, or
/// unparsable file means the worker is not ready yet, never an error.
pub async fn read_ports_file(path: &Path, expect_content: bool) -> Option<WorkerPorts> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    let mut ports = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        ports.push(line.parse::<u16>().ok()?);
    }
    let expected = if expect_content { 3 } else { 2 };
    if ports.len() < expected {
        return None;
    }
    Some(WorkerPorts {
        data_in: ports[0],
        metadata_out: ports[1],
        content_out: expect_content.then(|| ports[2]),
    })
}

/// Writes the ports file under a scratch name and renames it into place,
/// so a poller never observes a partially written file.
pub async fn write_ports_file(path: &Path, ports: &[u16]) -> io::Result<()> {
    let mut text = String::new();
    for port in ports {
        text.push_str(&port.to_string());
        text.push('\n');
    }
    let scratch = path.with_extension("properties.tmp");
    tokio::fs::write(&scratch, text).await?;
    tokio::fs::rename(&scratch, path).await
}

/// Connects to a loopback port, retrying through the window between the
/// worker binding its listener and posting an accept.
pub async fn connect_retry(port: u16, attempts: u32, delay: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for attempt in 0..attempts {
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Connect attempt {} to port {} failed: {}", attempt + 1, port, e);
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::TimedOut, "connect retries exhausted")
    }))
}

/// Writes the request header: `<baseUri>\n<contentType>\n`. The raw body
/// bytes follow, terminated by closing the write side.
pub async fn write_request_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    base_uri: &str,
    content_type: &str,
) -> io::Result<()> {
    writer.write_all(base_uri.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(content_type.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Reads one newline-terminated header line. Bytes past the newline stay
/// in `buf`; they belong to the next line or to the body.
pub async fn read_header_line<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> io::Result<String> {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            return String::from_utf8(line[..pos].to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "header is not UTF-8"));
        }
        if buf.len() > MAX_HEADER_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "header line too long",
            ));
        }
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside the request header",
            ));
        }
    }
}
