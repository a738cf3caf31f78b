//! Merge a full remote snapshot into the local store

use std::collections::{HashMap, HashSet};

use crate::models::{Entry, EntryId};

/// Local changes derived from one remote snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Clean entries that are new or differ from the local copy
    pub upserts: Vec<Entry>,
    /// Clean private entries that no longer exist remotely
    pub removals: Vec<EntryId>,
    /// Remote entries left alone because a local action is still queued
    pub skipped_dirty: usize,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Compute what reconciling `remote` into `local` would change.
///
/// Entries in `dirty` are never touched. The remote copy wins for every
/// other entry.
pub fn plan_reconcile(local: &[Entry], remote: &[Entry], dirty: &HashSet<EntryId>) -> ReconcilePlan {
    let local_by_id: HashMap<EntryId, &Entry> =
        local.iter().map(|entry| (entry.id, entry)).collect();
    let remote_ids: HashSet<EntryId> = remote.iter().map(|entry| entry.id).collect();

    let mut plan = ReconcilePlan::default();

    for entry in remote {
        if dirty.contains(&entry.id) {
            plan.skipped_dirty += 1;
            continue;
        }
        if local_by_id.get(&entry.id) != Some(&entry) {
            plan.upserts.push(entry.clone());
        }
    }

    plan.removals = local
        .iter()
        .filter(|entry| {
            entry.targets_private()
                && !remote_ids.contains(&entry.id)
                && !dirty.contains(&entry.id)
        })
        .map(|entry| entry.id)
        .collect();

    plan
}
