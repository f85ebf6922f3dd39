//! Spawn, readiness handshake, and teardown for one forked worker.
//!
//! A worker is launched with its settings in a scratch properties file and
//! becomes usable only after it has bound all of its listening sockets and
//! published the ports file. The two-stage type split (`SpawnedWorker` then
//! `ForkedWorkerProcess`) keeps a not-yet-bound child unconnectable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{Result, SpawnError};
use crate::protocol::{self, Properties, WorkerPorts, LOG_MARKER};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A launched worker that has not yet published its ports.
pub struct SpawnedWorker {
    child: Child,
    run_uuid: String,
    config_path: PathBuf,
    ports_path: PathBuf,
    parse_content: bool,
}

/// A ready worker: all listeners bound, ports known.
#[derive(Debug)]
pub struct ForkedWorkerProcess {
    child: Child,
    run_uuid: String,
    config_path: PathBuf,
    ports_path: PathBuf,
    ports: WorkerPorts,
    destroyed: bool,
}

/// Launches a worker process. The parser properties are written to a
/// scratch file keyed by a fresh run uuid and referenced on the command
/// line, so no property value ever travels through the argument list.
pub async fn spawn(
    config: &WorkerConfig,
    work_dir: &Path,
    parser_props: &Properties,
) -> Result<SpawnedWorker> {
    let run_uuid = Uuid::new_v4().to_string();
    let config_path = protocol::config_file_path(work_dir, &run_uuid);
    let ports_path = protocol::ports_file_path(work_dir, &run_uuid);

    let mut props = parser_props.clone();
    props.set(protocol::properties::keys::RUN_UUID, run_uuid.clone());
    props.store(&config_path).await?;
    let parse_content = props.get_bool(protocol::properties::keys::PARSE_CONTENT, true);

    let mut command = Command::new(&config.runtime_path);
    if let Some(heap_mb) = config.heap_limit_mb.filter(|mb| *mb > 0) {
        command.arg(format!("-Xmx{heap_mb}m"));
    }
    command
        .args(&config.launch_args)
        .arg("--parserPropertiesFilePath")
        .arg(&config_path)
        .arg("--workDirectoryPath")
        .arg(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        SpawnError::LaunchFailed(format!(
            "could not start {}: {}",
            config.runtime_path.display(),
            e
        ))
    })?;
    tracing::info!(
        "Started worker {} with runtime {}",
        run_uuid,
        config.runtime_path.display()
    );

    // Both pipes are drained for the life of the child; a full, unread
    // pipe buffer would otherwise block the child mid-write.
    if let Some(stdout) = child.stdout.take() {
        spawn_output_drain(stdout, run_uuid.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_output_drain(stderr, run_uuid.clone());
    }

    Ok(SpawnedWorker {
        child,
        run_uuid,
        config_path,
        ports_path,
        parse_content,
    })
}

fn spawn_output_drain<R>(stream: R, run_uuid: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            // Only marked lines reach the host log; parsers write noise.
            if let Some(rest) = line.strip_prefix(LOG_MARKER) {
                tracing::info!(target: "forkparse::worker", "[{}]{}", run_uuid, rest);
            }
        }
    });
}

impl SpawnedWorker {
    pub fn run_uuid(&self) -> &str {
        &self.run_uuid
    }

    /// Polls the ports file until it holds the expected number of ports.
    /// Fails fast if the child exits first. On any failure the child is
    /// killed and its scratch files removed.
    pub async fn await_ready(mut self, timeout: Duration) -> Result<ForkedWorkerProcess> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(ports) =
                protocol::read_ports_file(&self.ports_path, self.parse_content).await
            {
                tracing::debug!("Worker {} ready on {:?}", self.run_uuid, ports);
                return Ok(ForkedWorkerProcess {
                    child: self.child,
                    run_uuid: self.run_uuid,
                    config_path: self.config_path,
                    ports_path: self.ports_path,
                    ports,
                    destroyed: false,
                });
            }
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.abandon().await;
                    return Err(SpawnError::ProcessDiedDuringStartup(status).into());
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Could not poll worker {}: {}", self.run_uuid, e);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                self.abandon().await;
                return Err(SpawnError::StartupTimeout(timeout).into());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn abandon(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("Ignoring kill failure for worker {}: {}", self.run_uuid, e);
        }
        remove_quietly(&self.config_path).await;
        remove_quietly(&self.ports_path).await;
    }
}

impl ForkedWorkerProcess {
    pub fn run_uuid(&self) -> &str {
        &self.run_uuid
    }

    pub fn ports(&self) -> &WorkerPorts {
        &self.ports
    }

    /// Liveness probe used by the pool's validate-on-return.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Force-terminates the process and best-effort deletes its scratch
    /// files. Idempotent; never fails.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Err(e) = self.child.kill().await {
            tracing::debug!("Ignoring kill failure for worker {}: {}", self.run_uuid, e);
        }
        remove_quietly(&self.config_path).await;
        remove_quietly(&self.ports_path).await;
        tracing::info!("Destroyed worker {}", self.run_uuid);
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("Ignoring failure deleting {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper_config() -> WorkerConfig {
        WorkerConfig {
            runtime_path: PathBuf::from("sh"),
            heap_limit_mb: None,
            // `sh -c` ignores the trailing arguments `spawn` appends,
            // so the stand-in child really stays alive.
            launch_args: vec!["-c".to_string(), "sleep 30".to_string()],
            ready_timeout_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn startup_times_out_when_no_ports_appear() {
        let dir = tempfile::tempdir().unwrap();
        let worker = spawn(&sleeper_config(), dir.path(), &Properties::new())
            .await
            .unwrap();
        let config_path = protocol::config_file_path(dir.path(), worker.run_uuid());

        let err = worker
            .await_ready(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ForkparseError::Spawn(SpawnError::StartupTimeout(_))
        ));
        // Scratch files are cleaned up with the failed worker.
        assert!(!config_path.exists());
    }

    #[tokio::test]
    async fn early_exit_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            runtime_path: PathBuf::from("false"),
            heap_limit_mb: None,
            launch_args: vec![],
            ready_timeout_ms: 60_000,
        };
        let worker = spawn(&config, dir.path(), &Properties::new()).await.unwrap();

        let started = std::time::Instant::now();
        let err = worker
            .await_ready(Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ForkparseError::Spawn(SpawnError::ProcessDiedDuringStartup(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn ready_worker_reports_published_ports_and_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let worker = spawn(&sleeper_config(), dir.path(), &Properties::new())
            .await
            .unwrap();

        // Stand in for the child: publish the ports file ourselves.
        let ports_path = protocol::ports_file_path(dir.path(), worker.run_uuid());
        protocol::write_ports_file(&ports_path, &[4101, 4102, 4103])
            .await
            .unwrap();

        let mut ready = worker.await_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(ready.ports().data_in, 4101);
        assert_eq!(ready.ports().content_out, Some(4103));
        assert!(ready.is_alive());

        ready.destroy().await;
        assert!(!ready.is_alive());
        ready.destroy().await;
        assert!(!ports_path.exists());
    }
}
