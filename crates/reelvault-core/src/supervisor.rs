//! Task supervisor
//!
//! Owns the root cancellation token and every long-running task handle,
//! so shutdown is a single ordered sequence instead of a pile of
//! orphaned spawns.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Holds spawned task handles and the cancellation tree
pub struct TaskSupervisor {
    token: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Root token; subsystems get children of it
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Child token for one subsystem, cancellable independently
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Track a handle so shutdown can join it
    pub fn register(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.push((name.into(), handle));
    }

    /// Cancel everything and join the tracked tasks, bounded by the
    /// grace period; stragglers are aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        info!("Supervisor shutting down: tasks={}", self.tasks.len());
        self.token.cancel();

        for (name, mut handle) in self.tasks.drain(..) {
            match timeout(grace, &mut handle).await {
                Ok(Ok(())) => info!("Task stopped: name={}", name),
                Ok(Err(e)) => warn!("Task panicked: name={}, error={}", name, e),
                Err(_) => {
                    warn!("Task exceeded grace period, aborting: name={}", name);
                    handle.abort();
                }
            }
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_cancels_and_joins() {
        let mut supervisor = TaskSupervisor::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let token = supervisor.token();
        let stopped_clone = stopped.clone();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            stopped_clone.store(true, Ordering::SeqCst);
        });
        supervisor.register("loop", handle);

        supervisor.shutdown(Duration::from_secs(1)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_child_tokens_follow_root() {
        let supervisor = TaskSupervisor::new();
        let child = supervisor.child_token();
        assert!(!child.is_cancelled());

        supervisor.token().cancel();
        assert!(child.is_cancelled());
    }
}
