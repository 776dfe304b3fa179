//! Trait for the recompute collaborator - abstracts the actual recomputation.

use std::time::Duration;

use async_trait::async_trait;

use crate::snapshot::Snapshot;

/// Failure modes of a recomputation run.
///
/// A domain failure is logged by the execution loop and never aborts it;
/// cancellation terminates the loop without re-arming.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The recomputation itself failed.
    #[error("recomputation failed")]
    Failed(#[from] anyhow::Error),

    /// The recomputation was cancelled, typically because the collaborator
    /// is shutting down.
    #[error("recomputation cancelled")]
    Cancelled,
}

impl ApplyError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(anyhow::anyhow!(message.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// The recomputation collaborator invoked by the execution loop.
///
/// `apply` receives the most recent coalesced snapshot plus the extra
/// lookback to cover for snapshots that were superseded without ever being
/// applied. Implementations are expected to return [`ApplyError::Cancelled`]
/// from in-flight calls once `shutdown` has been signalled.
#[async_trait]
pub trait RecomputeHandler: Send + Sync + 'static {
    /// Apply a snapshot, widening the effective window by `window_extension`.
    async fn apply(
        &self,
        snapshot: &Snapshot,
        window_extension: Duration,
    ) -> Result<(), ApplyError>;

    /// The configured recompute window. A zero window disables coalescing
    /// entirely - the coordinator drops submissions without queueing them.
    fn recompute_window(&self) -> Duration;

    /// Stop accepting new recomputation requests.
    fn shutdown(&self);
}
