//! Task-execution facility behind the coordinator's drain loop.

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The executor refused the task because it is shutting down.
#[derive(Debug, Clone, thiserror::Error)]
#[error("task rejected: executor is shutting down")]
pub struct SpawnRejected;

/// Extension point for running the drain loop asynchronously.
///
/// A rejected spawn must be surfaced as [`SpawnRejected`] rather than
/// panicking - the coordinator relies on it to drain waiters instead of
/// starting work that will never run.
pub trait TaskSpawner: Send + Sync + 'static {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<JoinHandle<()>, SpawnRejected>;
}

/// Spawner backed by a tokio runtime handle.
///
/// `close` flips the spawner into the rejecting state; clones share it.
#[derive(Clone)]
pub struct RuntimeSpawner {
    handle: tokio::runtime::Handle,
    closing: CancellationToken,
}

impl RuntimeSpawner {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            closing: CancellationToken::new(),
        }
    }

    /// Spawner for the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like
    /// [`tokio::runtime::Handle::current`].
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Reject all future spawns.
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }
}

impl TaskSpawner for RuntimeSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<JoinHandle<()>, SpawnRejected> {
        if self.closing.is_cancelled() {
            return Err(SpawnRejected);
        }
        Ok(self.handle.spawn(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawner_runs_tasks() {
        let spawner = RuntimeSpawner::current();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let handle = spawner
            .spawn(Box::pin(async move {
                tx.send(42).unwrap();
            }))
            .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn closed_spawner_rejects() {
        let spawner = RuntimeSpawner::current();
        spawner.close();

        assert!(spawner.is_closed());
        assert!(spawner.spawn(Box::pin(async {})).is_err());
    }

    #[tokio::test]
    async fn close_is_shared_across_clones() {
        let spawner = RuntimeSpawner::current();
        let clone = spawner.clone();

        spawner.close();
        assert!(clone.is_closed());
    }
}
