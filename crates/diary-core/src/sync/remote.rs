//! Remote store seam and failure classification

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Destination, Entry, EntryId, Mutation};

/// Whether a failed remote call is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Outage, timeout or throttling; retried on the next pass
    Retryable,
    /// The destination refused the request; the action is dead-lettered
    Fatal,
}

/// Failure of a single remote call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote rejected request: {0}")]
    Rejected(String),

    #[error("remote entry not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => FailureClass::Retryable,
            Self::Rejected(_) | Self::NotFound(_) => FailureClass::Fatal,
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), FailureClass::Retryable)
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Network-backed persistence for entries
///
/// Writes are keyed by the client-generated entry id: `create_entry` and
/// `insert_into` must behave as upserts so a replayed action never creates
/// a second remote copy.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create (or overwrite) an entry in the private store
    async fn create_entry(&self, entry: &Entry) -> RemoteResult<Entry>;

    /// Replace an existing private entry
    async fn update_entry(&self, id: &EntryId, entry: &Entry) -> RemoteResult<Entry>;

    /// Delete a private entry
    async fn delete_entry(&self, id: &EntryId) -> RemoteResult<()>;

    /// Full snapshot of the private store
    async fn fetch_all(&self) -> RemoteResult<Vec<Entry>>;

    /// Upsert an entry into a specific destination
    async fn insert_into(&self, destination: &Destination, entry: &Entry) -> RemoteResult<()>;

    /// Remove an entry from a specific destination
    async fn remove_from(&self, destination: &Destination, id: &EntryId) -> RemoteResult<()>;
}

/// Apply one mutation to one destination
///
/// The private store goes through the dedicated entry endpoints; shared
/// groups only know destination-scoped upserts and removals. Removing
/// something that is already gone counts as success.
pub async fn apply_mutation(
    remote: &dyn RemoteStore,
    mutation: &Mutation,
    destination: &Destination,
) -> RemoteResult<()> {
    let result = match (mutation, destination) {
        (Mutation::Create(entry), Destination::Private) => {
            remote.create_entry(entry).await.map(drop)
        }
        (Mutation::Update(entry), Destination::Private) => {
            remote.update_entry(&entry.id, entry).await.map(drop)
        }
        (Mutation::Delete(id), Destination::Private) => remote.delete_entry(id).await,
        (Mutation::Create(entry) | Mutation::Update(entry), Destination::Group(_)) => {
            remote.insert_into(destination, entry).await
        }
        (Mutation::Delete(id), Destination::Group(_)) => remote.remove_from(destination, id).await,
    };

    match (mutation, result) {
        (Mutation::Delete(_), Err(RemoteError::NotFound(_))) => Ok(()),
        (_, result) => result,
    }
}
