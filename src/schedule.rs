use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A periodic background job with explicit teardown.
///
/// The job first runs after `initial_delay`, then every `period`. Cancelling
/// stops future runs but never interrupts a run in progress: the loop only
/// observes cancellation between runs. Dropping the handle cancels it.
pub struct ScheduledTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with_token(name, CancellationToken::new(), initial_delay, period, job)
    }

    /// Like `spawn`, cancelled together with `token` (use a child token to group tasks).
    pub fn spawn_with_token<F, Fut>(
        name: impl Into<String>,
        token: CancellationToken,
        initial_delay: Duration,
        period: Duration,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_name = name.into();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }

            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // consume immediate first tick

            loop {
                job().await;
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }
            debug!(task = %task_name, "Scheduled task stopped");
        });

        Self {
            token,
            handle: Some(handle),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for the loop to exit, letting an in-progress run finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn runs_after_delay_then_periodically() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let task = ScheduledTask::spawn("test", Duration::from_secs(5), Duration::from_secs(60), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_running_job_finish() {
        let finished = Arc::new(AtomicU32::new(0));
        let flag = finished.clone();
        let task = ScheduledTask::spawn("slow", Duration::ZERO, Duration::from_secs(30), move || {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        task.cancel();
        task.shutdown().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_token_cancels_children() {
        let parent = CancellationToken::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let task = ScheduledTask::spawn_with_token(
            "child",
            parent.child_token(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        parent.cancel();
        task.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
