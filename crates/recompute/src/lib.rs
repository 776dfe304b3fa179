//! recompute: coalescing, single-flight recomputation coordination.
//!
//! One [`Coordinator`] per job accepts snapshot submissions, guarantees at
//! most one recomputation runs at a time, and merges submissions that race
//! with an in-flight run into a single follow-up using only the most recent
//! snapshot. Superseded snapshots widen the follow-up's effective window
//! instead of running individually.

mod coordinator;
mod executor;
mod handler;
mod latch;
mod registry;
mod slot;
mod snapshot;

pub use coordinator::{Coordinator, WaitError};
pub use executor::{RuntimeSpawner, SpawnRejected, TaskSpawner};
pub use handler::{ApplyError, RecomputeHandler};
pub use latch::CompletionLatch;
pub use registry::CoordinatorRegistry;
pub use slot::{PendingSlot, PendingUpdate, SetupAction};
pub use snapshot::Snapshot;
