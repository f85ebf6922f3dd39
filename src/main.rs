use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use forkparse::client::WorkerPool;
use forkparse::config;
use forkparse::error::Result;
use forkparse::runner::ParseRequest;

#[derive(Parser, Debug)]
#[command(name = "forkparse")]
#[command(about = "Parse documents in crash-isolated forked worker processes", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (TOML/JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Parse one file through a pooled worker and print its metadata
    Parse {
        /// File to parse
        file: PathBuf,

        /// Base URI recorded against the document
        #[arg(long)]
        base_uri: Option<String>,

        /// Content type hint passed to the parser
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,

        /// Per-parse deadline in milliseconds
        #[arg(long, default_value_t = 300_000)]
        abort_after_ms: u64,

        /// Cap on extracted content bytes
        #[arg(long, default_value_t = 100_000_000)]
        max_bytes_to_parse: u64,

        /// Write extracted content here instead of discarding it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check configuration without starting any worker
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("forkparse={log_level}").parse().unwrap()),
        )
        .init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)?
        }
        None => config::load_from_env_or_file()?,
    };
    config::validate(&config)?;

    match args.command {
        Command::Check => {
            info!(
                "Configuration is valid (runtime {}, up to {} workers)",
                config.worker.runtime_path.display(),
                config.pool.max_total
            );
            Ok(())
        }
        Command::Parse {
            file,
            base_uri,
            content_type,
            abort_after_ms,
            max_bytes_to_parse,
            output,
        } => {
            let pool = WorkerPool::new(config).await?;
            let result = run_parse(
                &pool,
                file,
                base_uri,
                content_type,
                abort_after_ms,
                max_bytes_to_parse,
                output,
            )
            .await;
            pool.close().await;
            if let Err(e) = &result {
                error!("Parse failed: {}", e);
            }
            result
        }
    }
}

async fn run_parse(
    pool: &WorkerPool,
    file: PathBuf,
    base_uri: Option<String>,
    content_type: String,
    abort_after_ms: u64,
    max_bytes_to_parse: u64,
    output: Option<PathBuf>,
) -> Result<()> {
    let base_uri = base_uri.unwrap_or_else(|| format!("file://{}", file.display()));
    let source = tokio::fs::File::open(&file).await?;

    let want_content = output.is_some();
    let sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::sink()),
    };

    let outcome = pool
        .parse(ParseRequest {
            base_uri,
            content_type,
            source,
            sink,
            abort_after_ms,
            max_bytes_to_parse,
            want_content,
        })
        .await?;

    if outcome.worker_crashed {
        error!("Worker died mid-parse; returning a flagged empty record");
    }
    if outcome.truncated {
        info!(
            "Content truncated at the {} byte cap",
            max_bytes_to_parse
        );
    }
    info!("Extracted {} content bytes", outcome.content_bytes);
    println!("{}", serde_json::to_string_pretty(&outcome.metadata)?);
    Ok(())
}
