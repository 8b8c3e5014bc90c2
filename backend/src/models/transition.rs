//! Recorded state transitions of the sync workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::repo::{FailureReason, SyncState};

/// A single state change of a repo within one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: SyncState,
    pub to: SyncState,
    pub at: DateTime<Utc>,
    /// Set when `to` is `failed` or `cancelled`.
    pub reason: Option<FailureReason>,
    pub detail: Option<String>,
}

impl Transition {
    pub fn is(&self, from: SyncState, to: SyncState) -> bool {
        self.from == from && self.to == to
    }
}
