//! Delivery of queued mutations to remote stores.

mod connectivity;
mod engine;
mod http;
mod reconcile;
mod remote;


pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use engine::{SaveOutcome, SyncEngine, SyncReport};
pub use http::{classify_status, HttpRemoteStore};
pub use reconcile::{plan_reconcile, ReconcilePlan};
pub use remote::{apply_mutation, FailureClass, RemoteError, RemoteResult, RemoteStore};
