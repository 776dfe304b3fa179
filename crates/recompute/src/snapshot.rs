//! Snapshot payload carried by update submissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A versioned payload to recompute from.
///
/// The coordinator never inspects `state` - it only coalesces snapshots and
/// hands the most recent one to the recompute handler. The timestamp orders
/// snapshots and feeds the window-extension bookkeeping when several of them
/// are merged into one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    state: serde_json::Value,
    timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(state: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self { state, timestamp }
    }

    pub fn state(&self) -> &serde_json::Value {
        &self.state
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
