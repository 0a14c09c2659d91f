//! Structured ownership of background tasks.
//!
//! Every long-running task (framers, routers, per-session handlers, bridge
//! relays) is spawned inside a [`Scope`]. Cancelling a scope cancels its
//! children; [`Scope::shutdown`] waits for every task it spawned.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Default)]
pub struct Scope {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nested scope: cancelled with its parent, tracked separately.
    pub fn child(&self) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Number of tasks spawned in this scope that are still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every task in the scope and wait for them to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.cancel.cancel();
        self.tracker.wait().await;
        tracing::trace!("Scope drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_waits_for_cancelled_tasks() {
        let scope = Scope::new();
        let token = scope.token();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scope.spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(());
        });

        scope.shutdown().await;
        assert!(rx.await.is_ok());
        assert_eq!(scope.active_tasks(), 0);
    }

    #[tokio::test]
    async fn child_is_cancelled_with_parent() {
        let parent = Scope::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_child_leaves_parent_running() {
        let parent = Scope::new();
        let child = parent.child();
        child.shutdown().await;
        assert!(!parent.is_cancelled());
    }
}
