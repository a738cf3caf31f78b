//! diary-core - Core library for Photo Diary
//!
//! Local-first storage for diary entries plus the engine that delivers
//! queued mutations to the private diary and shared groups. Every write is
//! durable locally before any network traffic; delivery and reconciliation
//! happen in the background and are observable through [`SyncStatus`].

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod sync;
mod util;

pub use config::{EngineConfig, RemoteConfig};
pub use error::{Error, Result};
pub use models::{Destination, Entry, EntryId, GroupId, Mutation, PendingAction};
pub use services::StorageService;
pub use state::{SyncState, SyncStatus};
pub use sync::{
    Connectivity, ConnectivityMonitor, HttpRemoteStore, RemoteStore, SaveOutcome, SyncEngine,
    SyncReport,
};
