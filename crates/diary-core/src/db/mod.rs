//! Database layer for Photo Diary

mod action_queue;
mod connection;
mod entry_store;
mod migrations;

use rusqlite::Connection;

use crate::error::Result;

pub use action_queue::{ActionQueue, SqliteActionQueue};
pub use connection::Database;
pub use entry_store::{LocalStore, SqliteLocalStore};

/// Run `f` atomically, joining the caller's transaction when one is open.
pub(crate) fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    if !conn.is_autocommit() {
        return f(conn);
    }

    let tx = conn.unchecked_transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}
