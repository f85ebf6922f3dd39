//! Fixed-delay periodic task, shared by the pool evictor and the temp
//! reaper. The next run is scheduled after the previous one finishes, so a
//! slow sweep never stacks up behind itself. Runs on tokio time, which lets
//! tests drive it with `tokio::time::{pause, advance}`.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

pub struct PeriodicTask {
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(initial_delay: Duration, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                job().await;
                tokio::time::sleep(period).await;
            }
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn runs_after_initial_delay_then_every_period() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let _task = PeriodicTask::spawn(
            Duration::from_secs(5),
            Duration::from_secs(10),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        // Let the task register its initial sleep before the clock moves.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        // `advance` wakes due timers but does not poll the woken task;
        // yield so the job actually runs before we observe the counter.
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = PeriodicTask::spawn(Duration::ZERO, Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::advance(Duration::from_millis(1)).await;
        task.cancel();
        let seen = runs.load(Ordering::SeqCst);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
