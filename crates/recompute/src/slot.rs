//! Pending-update slot with merge semantics.
//!
//! The slot holds at most one not-yet-started update. Submissions that race
//! with an in-flight recomputation merge into the existing entry: the newest
//! snapshot and setup action win, the earliest discarded timestamp is kept so
//! the eventual run can widen its effective window, and the completion latch
//! is shared so every merged caller is released together.
//!
//! The slot itself carries no lock - the coordinator guards it together with
//! the execution permit under one mutex, so "is there an entry" and "is a run
//! active" are always observed consistently.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::latch::CompletionLatch;
use crate::snapshot::Snapshot;

/// Action run on the execution task immediately before a snapshot is applied.
pub type SetupAction = Box<dyn FnOnce() + Send>;

/// A coalesced update waiting for the execution loop to pick it up.
pub struct PendingUpdate {
    snapshot: Snapshot,
    setup: Option<SetupAction>,
    /// Earliest timestamp among snapshots this entry superseded, if any.
    earliest_superseded: Option<DateTime<Utc>>,
    latch: CompletionLatch,
}

impl PendingUpdate {
    fn new(snapshot: Snapshot, setup: Option<SetupAction>) -> Self {
        Self {
            snapshot,
            setup,
            earliest_superseded: None,
            latch: CompletionLatch::new(),
        }
    }

    /// Fold a newer submission over this entry.
    ///
    /// The previous snapshot's timestamp becomes a superseded-timestamp
    /// candidate unless an earlier one is already recorded; the latch is
    /// carried forward unchanged so earlier callers stay subscribed. The
    /// superseded setup action is dropped unrun.
    fn superseded_by(self, snapshot: Snapshot, setup: Option<SetupAction>) -> Self {
        Self {
            snapshot,
            setup,
            earliest_superseded: Some(
                self.earliest_superseded
                    .unwrap_or_else(|| self.snapshot.timestamp()),
            ),
            latch: self.latch,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn latch(&self) -> &CompletionLatch {
        &self.latch
    }

    /// Run the setup action, if the most recent submission supplied one.
    pub fn run_setup(&mut self) {
        if let Some(setup) = self.setup.take() {
            setup();
        }
    }

    /// Extra lookback the recomputation should cover because superseded
    /// snapshots were never individually applied.
    ///
    /// A negative span means snapshots arrived out of chronological order;
    /// that is logged and clamped to zero, never treated as fatal.
    pub fn window_extension(&self, job: &str) -> Duration {
        let Some(earliest) = self.earliest_superseded else {
            return Duration::ZERO;
        };

        match (self.snapshot.timestamp() - earliest).to_std() {
            Ok(extension) => extension,
            Err(_) => {
                tracing::warn!(
                    job,
                    latest = %self.snapshot.timestamp(),
                    superseded = %earliest,
                    "Snapshots not supplied in time order - clamping window extension to zero"
                );
                Duration::ZERO
            }
        }
    }
}

/// Holds zero or one pending update.
#[derive(Default)]
pub struct PendingSlot {
    entry: Option<PendingUpdate>,
}

impl PendingSlot {
    pub fn new() -> Self {
        Self { entry: None }
    }

    /// Merge a submission into the slot, creating the entry if absent.
    pub fn merge(&mut self, snapshot: Snapshot, setup: Option<SetupAction>) {
        self.entry = Some(match self.entry.take() {
            None => PendingUpdate::new(snapshot, setup),
            Some(previous) => previous.superseded_by(snapshot, setup),
        });
    }

    /// Remove and return the current entry, leaving the slot empty.
    pub fn take(&mut self) -> Option<PendingUpdate> {
        self.entry.take()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// Sample the current entry's latch, if one is held.
    pub fn latch(&self) -> Option<CompletionLatch> {
        self.entry.as_ref().map(|entry| entry.latch().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot_at(secs: u32) -> Snapshot {
        Snapshot::new(
            serde_json::json!({"v": secs}),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, secs).unwrap(),
        )
    }

    #[test]
    fn first_merge_creates_entry_without_superseded_timestamp() {
        let mut slot = PendingSlot::new();
        slot.merge(snapshot_at(10), None);

        let entry = slot.take().unwrap();
        assert!(slot.is_empty());
        assert_eq!(entry.window_extension("job-1"), Duration::ZERO);
    }

    #[test]
    fn merge_keeps_latest_snapshot_and_earliest_superseded() {
        let mut slot = PendingSlot::new();
        slot.merge(snapshot_at(10), None);
        slot.merge(snapshot_at(20), None);
        slot.merge(snapshot_at(30), None);

        let entry = slot.take().unwrap();
        assert_eq!(entry.snapshot().state(), &serde_json::json!({"v": 30}));
        assert_eq!(entry.window_extension("job-1"), Duration::from_secs(20));
    }

    #[test]
    fn merge_carries_the_latch_forward() {
        let mut slot = PendingSlot::new();
        slot.merge(snapshot_at(10), None);
        let first_latch = slot.latch().unwrap();

        slot.merge(snapshot_at(20), None);
        let entry = slot.take().unwrap();

        entry.latch().release();
        assert!(first_latch.is_released());
    }

    #[test]
    fn out_of_order_merge_clamps_extension_to_zero() {
        let mut slot = PendingSlot::new();
        slot.merge(snapshot_at(30), None);
        slot.merge(snapshot_at(10), None);

        let entry = slot.take().unwrap();
        assert_eq!(entry.window_extension("job-1"), Duration::ZERO);
    }

    #[test]
    fn newest_setup_action_wins() {
        let mut slot = PendingSlot::new();
        slot.merge(snapshot_at(10), Some(Box::new(|| panic!("superseded setup must not run"))));

        let (tx, rx) = std::sync::mpsc::channel();
        slot.merge(
            snapshot_at(20),
            Some(Box::new(move || tx.send(()).unwrap())),
        );

        let mut entry = slot.take().unwrap();
        entry.run_setup();
        rx.try_recv().unwrap();
    }

    #[test]
    fn take_from_empty_slot_returns_none() {
        let mut slot = PendingSlot::new();
        assert!(slot.take().is_none());
        assert!(slot.latch().is_none());
    }
}
