//! Database connection management

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;

use super::migrations;

/// Database wrapper for the local `SQLite` file
///
/// Holds both the entry snapshots and the pending action queue; neither
/// ever touches the network.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let database = Self { conn };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let database = Self { conn };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for durability with reasonable write throughput
    fn configure(&self) -> Result<()> {
        // In-memory databases cannot switch to WAL
        self.conn.pragma_update(None, "journal_mode", "WAL").ok();
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn)
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LocalStore, SqliteLocalStore};
    use crate::models::Entry;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        let mut stmt = db.connection().prepare("SELECT 1").unwrap();
        let value: i32 = stmt.query_row([], |row| row.get(0)).unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("diary.db");
        let entry = Entry::new("Morning coffee", "cozy");

        {
            let db = Database::open(&path).unwrap();
            SqliteLocalStore::new(db.connection()).put(&entry).unwrap();
        }

        let db = Database::open(&path).unwrap();
        let loaded = SqliteLocalStore::new(db.connection())
            .get(&entry.id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, entry);
    }
}
