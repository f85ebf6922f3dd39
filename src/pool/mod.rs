//! Generic bounded object pool: create-on-demand, validate-on-return,
//! explicit invalidation, and an eviction pass the owner schedules.
//!
//! Ownership is the lending discipline: `borrow` moves the object out, so a
//! borrowed object cannot be handed to a second caller, and it re-enters the
//! pool only through `return_object` or `invalidate`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{PoolError, Result};

#[async_trait]
pub trait PooledFactory: Send + Sync + 'static {
    type Object: Send + 'static;

    async fn create(&self) -> Result<Self::Object>;

    /// Checked when an object is handed back; a failing object is destroyed
    /// instead of being returned to the idle set.
    async fn validate(&self, _obj: &mut Self::Object) -> bool {
        true
    }

    async fn destroy(&self, obj: Self::Object);
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    #[serde(default)]
    pub min_idle: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    #[serde(default = "default_block_when_exhausted")]
    pub block_when_exhausted: bool,
    /// None blocks indefinitely; zero fails immediately.
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    /// Zero disables the background evictor.
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_ms: u64,
    /// Idle longer than this is always evicted.
    #[serde(default)]
    pub min_evictable_idle_ms: Option<u64>,
    /// Idle longer than this is evicted only while more than minIdle
    /// objects are idle.
    #[serde(default)]
    pub soft_min_evictable_idle_ms: Option<u64>,
}

fn default_max_idle() -> usize {
    8
}

fn default_max_total() -> usize {
    8
}

fn default_block_when_exhausted() -> bool {
    true
}

fn default_eviction_interval() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_idle: default_max_idle(),
            max_total: default_max_total(),
            block_when_exhausted: default_block_when_exhausted(),
            max_wait_ms: None,
            eviction_interval_ms: default_eviction_interval(),
            min_evictable_idle_ms: None,
            soft_min_evictable_idle_ms: None,
        }
    }
}

struct Idle<T> {
    obj: T,
    idle_since: Instant,
}

struct Inner<T> {
    idle: VecDeque<Idle<T>>,
    /// Live objects: idle + borrowed. Never exceeds `max_total`.
    total: usize,
    closed: bool,
}

pub struct ObjectPool<F: PooledFactory> {
    factory: F,
    config: PoolConfig,
    inner: Mutex<Inner<F::Object>>,
    available: Notify,
}

impl<F: PooledFactory> ObjectPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                total: 0,
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Takes an idle object, or creates one under the `max_total` cap, or
    /// waits up to `max_wait_ms` for capacity. Fails with
    /// `PoolError::Exhausted` when the wait budget runs out (immediately
    /// when not blocking, or with a zero budget).
    pub async fn borrow(&self) -> Result<F::Object> {
        let deadline = self
            .config
            .max_wait_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            // Arm the wakeup before inspecting state so a return between
            // the unlock and the await is never missed.
            let notified = self.available.notified();
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(PoolError::Closed.into());
                }
                if let Some(idle) = inner.idle.pop_front() {
                    return Ok(idle.obj);
                }
                if inner.total < self.config.max_total {
                    inner.total += 1;
                    drop(inner);
                    match self.factory.create().await {
                        Ok(obj) => return Ok(obj),
                        Err(e) => {
                            self.inner.lock().await.total -= 1;
                            self.available.notify_one();
                            return Err(e);
                        }
                    }
                }
            }
            if !self.config.block_when_exhausted {
                return Err(PoolError::Exhausted.into());
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(PoolError::Exhausted.into());
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Hands a healthy object back to the idle set. Objects failing
    /// validation, exceeding `max_idle`, or returned after `close` are
    /// destroyed instead.
    pub async fn return_object(&self, mut obj: F::Object) {
        if !self.factory.validate(&mut obj).await {
            tracing::debug!("Returned object failed validation, destroying");
            self.invalidate(obj).await;
            return;
        }
        let excess = {
            let mut inner = self.inner.lock().await;
            if inner.closed || inner.idle.len() >= self.config.max_idle {
                inner.total -= 1;
                Some(obj)
            } else {
                inner.idle.push_back(Idle {
                    obj,
                    idle_since: Instant::now(),
                });
                None
            }
        };
        if let Some(obj) = excess {
            self.factory.destroy(obj).await;
        }
        self.available.notify_one();
    }

    /// Destroys a broken object and frees its capacity slot.
    pub async fn invalidate(&self, obj: F::Object) {
        {
            self.inner.lock().await.total -= 1;
        }
        self.factory.destroy(obj).await;
        self.available.notify_one();
    }

    /// One eviction pass: destroys idle objects past the hard idle cutoff,
    /// or past the soft cutoff while more than `min_idle` remain idle.
    pub async fn evict_once(&self) {
        let hard = self.config.min_evictable_idle_ms.map(Duration::from_millis);
        let soft = self
            .config
            .soft_min_evictable_idle_ms
            .map(Duration::from_millis);
        if hard.is_none() && soft.is_none() {
            return;
        }
        let now = Instant::now();
        let mut victims = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let mut kept = VecDeque::new();
            while let Some(idle) = inner.idle.pop_front() {
                let idled = now.saturating_duration_since(idle.idle_since);
                let above_min = kept.len() + inner.idle.len() >= self.config.min_idle;
                let evict = hard.is_some_and(|cutoff| idled >= cutoff)
                    || (above_min && soft.is_some_and(|cutoff| idled >= cutoff));
                if evict {
                    inner.total -= 1;
                    victims.push(idle.obj);
                } else {
                    kept.push_back(idle);
                }
            }
            inner.idle = kept;
        }
        for obj in victims {
            tracing::debug!("Evicting idle object");
            self.factory.destroy(obj).await;
            self.available.notify_one();
        }
    }

    /// Pre-creates objects until `min_idle` are idle (never exceeding
    /// `max_total`). Run from the evictor pass.
    pub async fn ensure_min_idle(&self) -> Result<()> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.closed
                    || inner.idle.len() >= self.config.min_idle
                    || inner.total >= self.config.max_total
                {
                    return Ok(());
                }
                inner.total += 1;
            }
            match self.factory.create().await {
                Ok(obj) => {
                    let mut inner = self.inner.lock().await;
                    inner.idle.push_back(Idle {
                        obj,
                        idle_since: Instant::now(),
                    });
                    drop(inner);
                    self.available.notify_one();
                }
                Err(e) => {
                    self.inner.lock().await.total -= 1;
                    self.available.notify_one();
                    return Err(e);
                }
            }
        }
    }

    /// Destroys all idle objects and rejects further borrows. Objects out
    /// on loan are destroyed when they come back.
    pub async fn close(&self) {
        let idle = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            let drained: Vec<_> = inner.idle.drain(..).map(|i| i.obj).collect();
            inner.total -= drained.len();
            drained
        };
        for obj in idle {
            self.factory.destroy(obj).await;
        }
        self.available.notify_waiters();
    }

    pub async fn num_idle(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    /// Objects currently out on loan.
    pub async fn num_active(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.total - inner.idle.len()
    }
}
