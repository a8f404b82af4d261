//! Grace-bounded shutdown: one root cancellation token, a child per pipeline.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use cognos_kernel::TaskId;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Recorded shutdown request.
#[derive(Debug, Clone)]
pub struct ShutdownRequest {
    /// Task created to carry the shutdown.
    pub task_id: TaskId,
    /// Caller supplied reason.
    pub reason: String,
    /// After this instant in-flight pipelines are cancelled.
    pub deadline: Instant,
}

/// Tracks whether shutdown was requested and cancels stragglers after the grace.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    root: CancellationToken,
    requested: AtomicBool,
    grace: Duration,
    request: Mutex<Option<ShutdownRequest>>,
}

impl ShutdownCoordinator {
    /// Creates the coordinator.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            root: CancellationToken::new(),
            requested: AtomicBool::new(false),
            grace,
            request: Mutex::new(None),
        }
    }

    /// Token for one pipeline, cancelled with the root.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Records the request. Only the first call wins.
    pub fn request(&self, task_id: TaskId, reason: impl Into<String>) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.request.lock() = Some(ShutdownRequest {
            task_id,
            reason: reason.into(),
            deadline: Instant::now() + self.grace,
        });
        true
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The recorded request.
    #[must_use]
    pub fn current(&self) -> Option<ShutdownRequest> {
        self.request.lock().clone()
    }

    /// Whether the grace period ran out.
    #[must_use]
    pub fn grace_expired(&self) -> bool {
        self.request
            .lock()
            .as_ref()
            .is_some_and(|request| Instant::now() >= request.deadline)
    }

    /// Cancels every pipeline token. Returns `false` if already cancelled.
    pub fn cancel_in_flight(&self) -> bool {
        if self.root.is_cancelled() {
            return false;
        }
        self.root.cancel();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_cancels_children() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(500));
        let token = coordinator.child_token();
        assert!(!coordinator.grace_expired());

        let task_id = TaskId::new();
        assert!(coordinator.request(task_id, "maintenance"));
        assert!(!coordinator.request(TaskId::new(), "again"));
        assert_eq!(coordinator.current().unwrap().task_id, task_id);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!coordinator.grace_expired());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(coordinator.grace_expired());

        assert!(coordinator.cancel_in_flight());
        assert!(token.is_cancelled());
        assert!(!coordinator.cancel_in_flight());
    }
}
