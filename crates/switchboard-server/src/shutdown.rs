//! Stop background tasks on shutdown.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the hub's cancellation token and the tasks listening to it.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Nothing tracked, not cancelled.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token tracked tasks should watch.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Track a task to be awaited by [`drain`](Self::drain).
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Number of tracked tasks not yet drained.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token and wait up to `timeout` for tracked tasks; stragglers
    /// are aborted. Safe to call more than once.
    pub async fn drain(&self, timeout: Duration) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            return;
        }
        info!(task_count = handles.len(), timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "draining background tasks");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "background tasks did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let coord = ShutdownCoordinator::default();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.tracked(), 0);
    }

    #[tokio::test]
    async fn drain_cancels_and_awaits() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let (tx, rx) = tokio::sync::oneshot::channel();
        coord.track(tokio::spawn(async move {
            token.cancelled().await;
            let _ = tx.send(());
        }));

        coord.drain(Duration::from_secs(1)).await;
        assert!(coord.is_shutting_down());
        assert_eq!(coord.tracked(), 0);
        rx.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_task_is_aborted() {
        let coord = ShutdownCoordinator::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });
        let abort = handle.abort_handle();
        coord.track(handle);

        coord.drain(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(abort.is_finished());
    }

    #[tokio::test]
    async fn drain_twice_is_harmless() {
        let coord = ShutdownCoordinator::new();
        coord.drain(Duration::from_millis(10)).await;
        coord.drain(Duration::from_millis(10)).await;
        assert!(coord.is_shutting_down());
    }
}
