use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

// ─── StopSignal ───────────────────────────────────────────────────────────

/// Receiving half of a cooperative stop flag.
///
/// Loops call [`StopSignal::sleep`] instead of a plain sleep: the wait
/// returns the moment the flag is raised, so shutdown latency is not a
/// whole interval.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal paired with the sender that raises it.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait up to `dur`. Returns `true` if the stop flag was raised (or its
    /// sender dropped) before the time ran out.
    pub async fn sleep(&mut self, dur: Duration) -> bool {
        let raised = async {
            // Err means the sender is gone, which is a stop as well.
            let _ = self.rx.wait_for(|stop| *stop).await;
        };
        tokio::time::timeout(dur, raised).await.is_ok()
    }
}

// ─── ScopedTask ───────────────────────────────────────────────────────────

/// A background loop whose lifetime is bound to its owner.
///
/// [`ScopedTask::shutdown`] raises the stop flag and joins the task with a
/// bounded wait; a task that does not finish in time is aborted. Dropping
/// a `ScopedTask` without calling `shutdown` raises the flag and aborts, so
/// no loop outlives the scope that started it.
#[derive(Debug)]
pub struct ScopedTask<T> {
    name: String,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> ScopedTask<T> {
    /// Spawn `body` with a fresh [`StopSignal`].
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (stop, signal) = StopSignal::channel();
        let handle = tokio::spawn(body(signal));
        Self {
            name: name.into(),
            stop,
            handle: Some(handle),
        }
    }

    /// Raise the stop flag and wait at most `grace` for the task's output.
    ///
    /// Returns `None` if the task panicked or had to be aborted.
    pub async fn shutdown(mut self, grace: Duration) -> Option<T> {
        let _ = self.stop.send(true);
        let mut handle = self.handle.take()?;

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(out)) => Some(out),
            Ok(Err(e)) => {
                tracing::warn!(task = %self.name, error = %e, "scoped task ended abnormally");
                None
            }
            Err(_) => {
                tracing::warn!(
                    task = %self.name,
                    grace_secs = grace.as_secs_f64(),
                    "scoped task did not stop in time; aborting"
                );
                handle.abort();
                None
            }
        }
    }
}

impl<T> Drop for ScopedTask<T> {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_to_completion_without_stop() {
        let (_tx, mut signal) = StopSignal::channel();
        let start = tokio::time::Instant::now();
        assert!(!signal.sleep(Duration::from_secs(30)).await);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_immediately_when_already_raised() {
        let (tx, mut signal) = StopSignal::channel();
        tx.send(true).unwrap();
        let start = tokio::time::Instant::now();
        assert!(signal.sleep(Duration::from_secs(30)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_interrupted_mid_wait() {
        let (tx, mut signal) = StopSignal::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = tx.send(true);
        });
        let start = tokio::time::Instant::now();
        assert!(signal.sleep(Duration::from_secs(60)).await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_counts_as_stop() {
        let (tx, mut signal) = StopSignal::channel();
        drop(tx);
        assert!(signal.sleep(Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_joins_and_returns_output() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let task = ScopedTask::spawn("counter", move |mut stop| async move {
            while !stop.sleep(Duration::from_secs(1)).await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            "stopped"
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let out = task.shutdown(Duration::from_secs(5)).await;
        assert_eq!(out, Some("stopped"));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_a_task_that_ignores_the_flag() {
        let task = ScopedTask::spawn("stubborn", |_stop| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let start = tokio::time::Instant::now();
        assert!(task.shutdown(Duration::from_secs(2)).await.is_none());
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
