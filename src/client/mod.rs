//! Host-side entry point: a bounded pool of forked workers with the
//! borrow / parse / return-or-invalidate discipline on top.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ForkparseConfig;
use crate::error::Result;
use crate::pool::{ObjectPool, PooledFactory};
use crate::process::{self, ForkedWorkerProcess};
use crate::protocol::Properties;
use crate::reaper::TempFileReaperService;
use crate::runner::{ParseOutcome, ParseRequest, ParseRunner};
use crate::schedule::PeriodicTask;

/// Creates ready workers for the pool: spawn, then wait for the ports
/// file. Validation on return is a plain liveness probe, so a worker that
/// died while idle (or while parsing, after a soft-crash outcome) is
/// replaced instead of being lent out again.
pub struct WorkerFactory {
    config: ForkparseConfig,
    parser_props: Properties,
}

impl WorkerFactory {
    pub fn new(config: ForkparseConfig) -> Self {
        let parser_props = config.parser.to_properties();
        Self {
            config,
            parser_props,
        }
    }
}

#[async_trait]
impl PooledFactory for WorkerFactory {
    type Object = ForkedWorkerProcess;

    async fn create(&self) -> Result<ForkedWorkerProcess> {
        let spawned = process::spawn(
            &self.config.worker,
            &self.config.work_directory_path,
            &self.parser_props,
        )
        .await?;
        spawned
            .await_ready(Duration::from_millis(self.config.worker.ready_timeout_ms))
            .await
    }

    async fn validate(&self, worker: &mut ForkedWorkerProcess) -> bool {
        worker.is_alive()
    }

    async fn destroy(&self, mut worker: ForkedWorkerProcess) {
        worker.destroy().await;
    }
}

pub struct WorkerPool {
    pool: Arc<ObjectPool<WorkerFactory>>,
    runner: ParseRunner,
    evictor: Option<PeriodicTask>,
    reaper: Option<TempFileReaperService>,
}

impl WorkerPool {
    /// Builds the pool, starts the idle evictor (when an eviction interval
    /// is configured) and the temp-file reaper. Workers themselves are
    /// created lazily on first borrow.
    pub async fn new(config: ForkparseConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.work_directory_path).await?;

        let runner = ParseRunner::new(config.crash_policy);
        let pool_config = config.pool.clone();
        let reaper = config
            .reaper
            .enabled
            .then(|| TempFileReaperService::start(config.work_directory_path.clone(), &config.reaper));
        let pool = Arc::new(ObjectPool::new(WorkerFactory::new(config), pool_config.clone()));

        let evictor = (pool_config.eviction_interval_ms > 0).then(|| {
            let interval = Duration::from_millis(pool_config.eviction_interval_ms);
            let pool = pool.clone();
            PeriodicTask::spawn(interval, interval, move || {
                let pool = pool.clone();
                async move {
                    pool.evict_once().await;
                    if let Err(e) = pool.ensure_min_idle().await {
                        tracing::warn!("Could not replenish idle workers: {}", e);
                    }
                }
            })
        });

        Ok(Self {
            pool,
            runner,
            evictor,
            reaper,
        })
    }

    /// Runs one parse on a pooled worker. On success the worker goes back
    /// to the idle set; on any failure (timeouts included) it is destroyed
    /// and the error propagates. Failed parses are never retried here.
    pub async fn parse<R, W>(&self, request: ParseRequest<R, W>) -> Result<ParseOutcome>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let worker = self.pool.borrow().await?;
        match self.runner.run(worker.ports(), request).await {
            Ok(outcome) => {
                self.pool.return_object(worker).await;
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!("Parse failed, discarding worker {}: {}", worker.run_uuid(), e);
                self.pool.invalidate(worker).await;
                Err(e)
            }
        }
    }

    pub async fn num_idle(&self) -> usize {
        self.pool.num_idle().await
    }

    pub async fn num_active(&self) -> usize {
        self.pool.num_active().await
    }

    /// Destroys every worker and stops the evictor and the reaper.
    pub async fn close(&self) {
        if let Some(evictor) = &self.evictor {
            evictor.cancel();
        }
        if let Some(reaper) = &self.reaper {
            reaper.close();
        }
        self.pool.close().await;
    }
}
