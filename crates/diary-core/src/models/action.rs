//! Pending action model

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::{Destination, Entry, EntryId};
use crate::error::{Error, Result};

/// Stable handle of a queued action (the queue's autoincrement key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(i64);

impl ActionId {
    pub(crate) const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown action kind: {other}"))),
        }
    }
}

/// A mutation together with its payload
///
/// Create and Update carry the full entry snapshot; Delete carries only the id.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create(Entry),
    Update(Entry),
    Delete(EntryId),
}

impl Mutation {
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::Create(_) => ActionKind::Create,
            Self::Update(_) => ActionKind::Update,
            Self::Delete(_) => ActionKind::Delete,
        }
    }

    /// Id of the entry this mutation touches
    pub const fn entry_id(&self) -> EntryId {
        match self {
            Self::Create(entry) | Self::Update(entry) => entry.id,
            Self::Delete(id) => *id,
        }
    }

    /// Encode the payload column
    pub(crate) fn payload_json(&self) -> Result<String> {
        Ok(match self {
            Self::Create(entry) | Self::Update(entry) => serde_json::to_string(entry)?,
            Self::Delete(id) => serde_json::to_string(id)?,
        })
    }

    /// Decode a stored `(kind, payload)` pair
    pub(crate) fn from_parts(kind: ActionKind, payload: &str) -> Result<Self> {
        Ok(match kind {
            ActionKind::Create => Self::Create(serde_json::from_str(payload)?),
            ActionKind::Update => Self::Update(serde_json::from_str(payload)?),
            ActionKind::Delete => Self::Delete(serde_json::from_str(payload)?),
        })
    }
}

/// Delivery status of one action at one destination
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum TargetStatus {
    /// Not attempted yet
    #[default]
    Pending,
    /// Confirmed by the destination; never submitted again
    Applied,
    /// Last attempt failed with the given reason
    Failed(String),
}

impl TargetStatus {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A mutation waiting to be confirmed by every destination
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    /// Queue handle, also the FIFO position
    pub id: ActionId,
    pub mutation: Mutation,
    /// Per-destination delivery status
    pub targets: BTreeMap<Destination, TargetStatus>,
    /// Enqueue timestamp (Unix ms)
    pub enqueued_at: i64,
}

impl PendingAction {
    pub const fn kind(&self) -> ActionKind {
        self.mutation.kind()
    }

    pub const fn entry_id(&self) -> EntryId {
        self.mutation.entry_id()
    }

    /// Destinations still waiting for a successful call
    pub fn remaining_targets(&self) -> impl Iterator<Item = &Destination> {
        self.targets
            .iter()
            .filter(|(_, status)| !status.is_applied())
            .map(|(destination, _)| destination)
    }

    /// True once every destination has confirmed the mutation
    pub fn is_fully_applied(&self) -> bool {
        self.targets.values().all(TargetStatus::is_applied)
    }

    /// The original target set, regardless of status
    pub fn destinations(&self) -> BTreeSet<Destination> {
        self.targets.keys().cloned().collect()
    }
}

/// An action removed from the queue after a destination rejected it outright
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub action: PendingAction,
    /// Rejection reported by the destination
    pub reason: String,
    /// When the action left the queue (Unix ms)
    pub dead_lettered_at: i64,
}
