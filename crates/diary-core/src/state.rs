//! Sync status published to the presentation layer.

use crate::models::{Destination, EntryId};
use crate::sync::{Connectivity, FailureClass};

/// Coarse sync state a client can render directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Syncing,
    /// Saved locally, waiting to sync
    Pending,
    Synced,
    Error,
}

/// Where the coordinator currently is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Draining,
    Reconciling,
}

/// Most recent remote failure, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncIssue {
    pub entry_id: Option<EntryId>,
    pub destination: Option<Destination>,
    pub class: FailureClass,
    pub message: String,
    /// Unix ms
    pub at: i64,
}

/// Snapshot of the engine's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub connectivity: Connectivity,
    pub pending_actions: usize,
    pub dead_letters: usize,
    pub last_issue: Option<SyncIssue>,
    /// Unix ms of the last completed reconcile
    pub last_synced_at: Option<i64>,
}

impl SyncStatus {
    pub const fn new(connectivity: Connectivity) -> Self {
        Self {
            phase: SyncPhase::Idle,
            connectivity,
            pending_actions: 0,
            dead_letters: 0,
            last_issue: None,
            last_synced_at: None,
        }
    }

    pub const fn state(&self) -> SyncState {
        if !matches!(self.phase, SyncPhase::Idle) {
            SyncState::Syncing
        } else if !self.connectivity.is_online() {
            SyncState::Offline
        } else if self.dead_letters > 0 {
            SyncState::Error
        } else if self.pending_actions > 0 {
            SyncState::Pending
        } else {
            SyncState::Synced
        }
    }
}
