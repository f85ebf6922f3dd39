//! The worker-side main loop.
//!
//! Binds the per-worker listeners, publishes the ports file once all of
//! them are bound (the host's sole readiness signal), then serves exactly
//! one request at a time: read the framed input, run the parser, write the
//! metadata record, stream the content, close the per-request sockets,
//! loop.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;
use crate::protocol;

pub mod parser;

pub use parser::{parser_from_properties, ParsedDocument, Parser, ParserLimits, ParserOptions};

/// Ports to bind the per-channel listeners on. Zero binds an ephemeral
/// port; deployments that pin ports (firewalled containers) set them
/// explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenPorts {
    pub data_in: u16,
    pub metadata_out: u16,
    pub content_out: u16,
}

pub struct WorkerServer {
    parser: Box<dyn Parser>,
    parse_content: bool,
    work_dir: PathBuf,
    run_uuid: String,
    listen: ListenPorts,
}

impl WorkerServer {
    pub fn new(
        parser: Box<dyn Parser>,
        parse_content: bool,
        work_dir: PathBuf,
        run_uuid: String,
    ) -> Self {
        Self {
            parser,
            parse_content,
            work_dir,
            run_uuid,
            listen: ListenPorts::default(),
        }
    }

    pub fn with_listen_ports(mut self, listen: ListenPorts) -> Self {
        self.listen = listen;
        self
    }

    /// Runs forever (until the host kills the process). The ports file is
    /// written only after every listener is bound, and removed again on
    /// the way out.
    pub async fn run(self) -> Result<()> {
        let data_in = bind(self.listen.data_in).await?;
        let metadata_out = bind(self.listen.metadata_out).await?;
        let content_out = if self.parse_content {
            Some(bind(self.listen.content_out).await?)
        } else {
            None
        };

        let mut ports = vec![local_port(&data_in)?, local_port(&metadata_out)?];
        if let Some(listener) = &content_out {
            ports.push(local_port(listener)?);
        }
        let ports_path = protocol::ports_file_path(&self.work_dir, &self.run_uuid);
        protocol::write_ports_file(&ports_path, &ports).await?;
        tracing::info!("Worker {} listening on {:?}", self.run_uuid, ports);

        let result = self
            .serve(&data_in, &metadata_out, content_out.as_ref())
            .await;

        if let Err(e) = tokio::fs::remove_file(&ports_path).await {
            tracing::debug!("Ignoring failure deleting {}: {}", ports_path.display(), e);
        }
        result
    }

    async fn serve(
        &self,
        data_in: &TcpListener,
        metadata_out: &TcpListener,
        content_out: Option<&TcpListener>,
    ) -> Result<()> {
        loop {
            let (data, peer) = data_in.accept().await?;
            tracing::debug!("Accepted request connection from {}", peer);
            // Request-scoped failures mean the caller went away (timed
            // out, hit its byte cap, crashed); the host discards this
            // worker on its own failures, so serving on is always safe.
            if let Err(e) = self.handle_request(data, metadata_out, content_out).await {
                tracing::warn!("Request failed: {}", e);
            }
        }
    }

    async fn handle_request(
        &self,
        mut data: TcpStream,
        metadata_out: &TcpListener,
        content_out: Option<&TcpListener>,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let base_uri = protocol::read_header_line(&mut data, &mut buf).await?;
        let content_type = protocol::read_header_line(&mut data, &mut buf).await?;
        tracing::info!("Parsing baseUri={} contentType={}", base_uri, content_type);

        let mut body = buf.to_vec();
        data.read_to_end(&mut body).await?;
        drop(data);

        let parsed = self.parser.parse(&base_uri, &content_type, &body).await;

        let (mut metadata_sock, _) = metadata_out.accept().await?;
        let doc = match parsed {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("Parse of {} failed: {}", base_uri, e);
                // Closing without a record tells the caller the parse
                // died; it decides whether to synthesize or raise.
                drop(metadata_sock);
                if let Some(listener) = content_out {
                    let (sock, _) = listener.accept().await?;
                    drop(sock);
                }
                return Ok(());
            }
        };

        let record = serde_json::to_vec(&doc.metadata)?;
        metadata_sock.write_all(&record).await?;
        metadata_sock.shutdown().await?;
        drop(metadata_sock);

        if let Some(listener) = content_out {
            let (mut content_sock, _) = listener.accept().await?;
            // The caller may hang up mid-stream at its byte cap; that is
            // its prerogative, not a worker failure.
            match content_sock.write_all(&doc.content).await {
                Ok(()) => {
                    let _ = content_sock.shutdown().await;
                }
                Err(e) => {
                    tracing::debug!("Caller abandoned the content stream: {}", e);
                }
            }
        }
        Ok(())
    }
}

async fn bind(port: u16) -> Result<TcpListener> {
    Ok(TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?)
}

fn local_port(listener: &TcpListener) -> Result<u16> {
    Ok(listener.local_addr()?.port())
}
