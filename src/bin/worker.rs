//! The forked worker executable.
//!
//! A host process launches one of these per pooled worker, pointing it at a
//! properties payload file and a work directory. The worker binds its
//! sockets, publishes its ports file, and serves parse requests until the
//! host kills it. Everything written to stdout is prefixed with the log
//! marker so the host can tell worker log lines from parser noise.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser as ClapParser;
use tracing_subscriber::fmt::MakeWriter;

use forkparse::protocol::properties::keys;
use forkparse::protocol::{Properties, LOG_MARKER};
use forkparse::server::{parser_from_properties, ListenPorts, WorkerServer};

#[derive(ClapParser, Debug)]
#[command(name = "forkparse-worker")]
#[command(about = "Forked parse worker (launched by a forkparse host)", long_about = None)]
struct Args {
    /// Path to the properties payload written by the host at spawn
    #[arg(long = "parserPropertiesFilePath", alias = "parser-properties-file-path")]
    parser_properties_file_path: PathBuf,

    /// Directory for the ports file and scratch files
    #[arg(long = "workDirectoryPath", alias = "configDirectoryPath")]
    work_directory_path: PathBuf,

    /// Fixed port for the request data listener (0 binds ephemerally)
    #[arg(long = "dataInServerPort", alias = "data-in-server-port", default_value_t = 0)]
    data_in_server_port: u16,

    /// Fixed port for the metadata listener (0 binds ephemerally)
    #[arg(long = "metadataOutServerPort", alias = "metadata-out-server-port", default_value_t = 0)]
    metadata_out_server_port: u16,

    /// Fixed port for the content listener (0 binds ephemerally)
    #[arg(long = "contentOutServerPort", alias = "content-out-server-port", default_value_t = 0)]
    content_out_server_port: u16,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Writes every log line behind the marker the host filters on.
struct MarkedStdout;

struct MarkedWriter {
    inner: io::Stdout,
}

impl Write for MarkedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all(LOG_MARKER.as_bytes())?;
        self.inner.write_all(b" ")?;
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for MarkedStdout {
    type Writer = MarkedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MarkedWriter { inner: io::stdout() }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("forkparse={log_level}").parse().unwrap()),
        )
        .with_writer(MarkedStdout)
        .init();

    let props = Properties::load(&args.parser_properties_file_path)
        .await
        .with_context(|| {
            format!(
                "could not read properties payload {}",
                args.parser_properties_file_path.display()
            )
        })?;

    let run_uuid = props
        .get(keys::RUN_UUID)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let parse_content = props.get_bool(keys::PARSE_CONTENT, true);
    let parser =
        parser_from_properties(&props).context("unknown parser in the properties payload")?;

    tracing::info!(
        "Worker {} starting in {} (parseContent={})",
        run_uuid,
        args.work_directory_path.display(),
        parse_content
    );

    let server = WorkerServer::new(parser, parse_content, args.work_directory_path, run_uuid)
        .with_listen_ports(ListenPorts {
            data_in: args.data_in_server_port,
            metadata_out: args.metadata_out_server_port,
            content_out: args.content_out_server_port,
        });
    server.run().await?;
    Ok(())
}
