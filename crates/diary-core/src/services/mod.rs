//! Shared services used by client shells.

mod storage;

pub use storage::StorageService;
