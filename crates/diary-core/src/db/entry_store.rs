//! Local entry snapshot store

use crate::error::{Error, Result};
use crate::models::{Entry, EntryId};
use crate::util::unix_millis_now;
use rusqlite::{params, Connection, OptionalExtension};

use super::in_transaction;

/// Durable snapshot storage for entries, keyed by id
pub trait LocalStore {
    /// Insert or replace the snapshot for `entry.id`
    fn put(&self, entry: &Entry) -> Result<()>;

    /// Upsert a batch of snapshots atomically
    fn put_all(&self, entries: &[Entry]) -> Result<()>;

    /// Get a snapshot by id
    fn get(&self, id: &EntryId) -> Result<Option<Entry>>;

    /// All snapshots, most recently recorded first
    fn get_all(&self) -> Result<Vec<Entry>>;

    /// Remove a snapshot. Returns whether one existed.
    fn delete(&self, id: &EntryId) -> Result<bool>;
}

/// `SQLite` implementation of `LocalStore`
pub struct SqliteLocalStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteLocalStore<'a> {
    /// Create a new store over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn upsert(conn: &Connection, entry: &Entry, stored_at: i64) -> Result<()> {
        let snapshot = serde_json::to_string(entry)?;
        conn.execute(
            "INSERT INTO entries (id, recorded_at, snapshot, stored_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                recorded_at = excluded.recorded_at,
                snapshot = excluded.snapshot,
                stored_at = excluded.stored_at",
            params![entry.id.as_str(), entry.recorded_at, snapshot, stored_at],
        )?;
        Ok(())
    }

    fn parse_snapshot(raw: &str) -> Result<Entry> {
        serde_json::from_str(raw)
            .map_err(|error| Error::Database(format!("corrupt entry snapshot: {error}")))
    }
}

impl LocalStore for SqliteLocalStore<'_> {
    fn put(&self, entry: &Entry) -> Result<()> {
        Self::upsert(self.conn, entry, unix_millis_now())
    }

    fn put_all(&self, entries: &[Entry]) -> Result<()> {
        let now = unix_millis_now();
        in_transaction(self.conn, |conn| {
            for entry in entries {
                Self::upsert(conn, entry, now)?;
            }
            Ok(())
        })
    }

    fn get(&self, id: &EntryId) -> Result<Option<Entry>> {
        let snapshot: Option<String> = self
            .conn
            .query_row(
                "SELECT snapshot FROM entries WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        snapshot.as_deref().map(Self::parse_snapshot).transpose()
    }

    fn get_all(&self) -> Result<Vec<Entry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT snapshot FROM entries ORDER BY recorded_at DESC, id DESC")?;

        let snapshots = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        snapshots
            .iter()
            .map(|raw| Self::parse_snapshot(raw))
            .collect()
    }

    fn delete(&self, id: &EntryId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM entries WHERE id = ?1", params![id.as_str()])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        let entry = Entry::new("First swim of the year", "brave").with_tags(["sea"]);
        store.put(&entry).unwrap();

        let fetched = store.get(&entry.id).unwrap().unwrap();
        assert_eq!(fetched, entry);
    }

    #[test]
    fn test_put_is_upsert() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        let mut entry = Entry::new("Draft", "meh");
        store.put(&entry).unwrap();
        entry.caption = "Final".to_string();
        store.put(&entry).unwrap();
        store.put(&entry).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].caption, "Final");
    }

    #[test]
    fn test_get_all_sorted_by_recorded_at_desc() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        let old = Entry::new("old", "calm").with_recorded_at(1_000);
        let new = Entry::new("new", "calm").with_recorded_at(3_000);
        let mid = Entry::new("mid", "calm").with_recorded_at(2_000);
        store.put_all(&[old, new, mid]).unwrap();

        let captions: Vec<_> = store
            .get_all()
            .unwrap()
            .into_iter()
            .map(|entry| entry.caption)
            .collect();
        assert_eq!(captions, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_delete() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());

        let entry = Entry::new("To delete", "sad");
        store.put(&entry).unwrap();

        assert!(store.delete(&entry.id).unwrap());
        assert!(store.get(&entry.id).unwrap().is_none());
        assert!(!store.delete(&entry.id).unwrap());
    }

    #[test]
    fn test_missing_entry_is_none() {
        let db = setup();
        let store = SqliteLocalStore::new(db.connection());
        assert!(store.get(&EntryId::new()).unwrap().is_none());
    }
}
