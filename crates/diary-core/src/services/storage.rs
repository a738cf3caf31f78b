//! Shared storage service wrapping the local database.
//!
//! Every method takes the store lock for the duration of one local
//! operation only; nothing here touches the network.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{
    in_transaction, ActionQueue, Database, LocalStore, SqliteActionQueue, SqliteLocalStore,
};
use crate::models::{
    ActionId, DeadLetter, Destination, Entry, EntryId, Mutation, PendingAction, TargetStatus,
};
use crate::sync::ReconcilePlan;
use crate::{Error, Result};

/// Thread-safe handle to the local entry store and action queue.
#[derive(Clone)]
pub struct StorageService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl StorageService {
    /// Open (or create) the store at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and replaced by a fresh
    /// store.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path) {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local database at {} is unreadable: {}. Starting from an empty store.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path)?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let file_name = db_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("diary.db");
            let backup_path = db_path.with_file_name(format!("{file_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local DB file from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        for suffix in ["-wal", "-shm"] {
            let sidecar = db_path.with_file_name(format!("{base_name}{suffix}"));
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
            }
        }
        Ok(())
    }

    /// Upsert an entry snapshot without queueing anything.
    pub async fn put_entry(&self, entry: &Entry) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).put(entry)
    }

    /// Fetch an entry by id.
    pub async fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).get(id)
    }

    /// All entries, newest first.
    pub async fn list_entries(&self) -> Result<Vec<Entry>> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).get_all()
    }

    /// Remove an entry snapshot without queueing anything.
    pub async fn delete_entry(&self, id: &EntryId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteLocalStore::new(db.connection()).delete(id)
    }

    /// Apply a mutation locally and queue it for delivery, atomically.
    ///
    /// Returns the queued actions in delivery order. An update that changes
    /// an entry's targets is split: the kept destinations get the update,
    /// added ones get a create and dropped ones get a delete.
    pub async fn record_mutation(&self, mutation: &Mutation) -> Result<Vec<PendingAction>> {
        let db = self.db.lock().await;
        in_transaction(db.connection(), |conn| {
            let store = SqliteLocalStore::new(conn);
            let queue = SqliteActionQueue::new(conn);
            let mut queued = Vec::with_capacity(3);

            match mutation {
                Mutation::Create(entry) => {
                    entry.validate()?;
                    if store.get(&entry.id)?.is_some() {
                        return Err(Error::InvalidInput(format!(
                            "entry {} already exists",
                            entry.id
                        )));
                    }
                    store.put(entry)?;
                    queued.push(queue.enqueue(mutation, &entry.targets)?);
                }
                Mutation::Update(entry) => {
                    entry.validate()?;
                    let previous = store
                        .get(&entry.id)?
                        .ok_or_else(|| Error::NotFound(format!("entry {}", entry.id)))?;
                    store.put(entry)?;

                    let kept: BTreeSet<Destination> = entry
                        .targets
                        .intersection(&previous.targets)
                        .cloned()
                        .collect();
                    let added: BTreeSet<Destination> =
                        entry.targets.difference(&previous.targets).cloned().collect();
                    let dropped: BTreeSet<Destination> =
                        previous.targets.difference(&entry.targets).cloned().collect();

                    if !kept.is_empty() {
                        queued.push(queue.enqueue(mutation, &kept)?);
                    }
                    // Destinations that never saw the entry need a create, not an update.
                    if !added.is_empty() {
                        queued.push(queue.enqueue(&Mutation::Create(entry.clone()), &added)?);
                    }
                    if !dropped.is_empty() {
                        queued.push(queue.enqueue(&Mutation::Delete(entry.id), &dropped)?);
                    }
                }
                Mutation::Delete(id) => {
                    let targets = store
                        .get(id)?
                        .map_or_else(|| BTreeSet::from([Destination::Private]), |entry| {
                            entry.targets
                        });
                    store.delete(id)?;
                    queued.push(queue.enqueue(mutation, &targets)?);
                }
            }

            queued
                .into_iter()
                .map(|id| {
                    queue
                        .get(id)?
                        .ok_or_else(|| Error::Database(format!("action {id} vanished")))
                })
                .collect()
        })
    }

    /// Queued actions in enqueue order.
    pub async fn list_actions(&self) -> Result<Vec<PendingAction>> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).list_all()
    }

    pub async fn get_action(&self, id: ActionId) -> Result<Option<PendingAction>> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).get(id)
    }

    /// Oldest queued action for an entry.
    pub async fn earliest_action_for(&self, entry_id: &EntryId) -> Result<Option<ActionId>> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).earliest_for(entry_id)
    }

    pub async fn remove_action(&self, id: ActionId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).remove(id)
    }

    /// Record the delivery status of one destination.
    pub async fn mark_target(
        &self,
        id: ActionId,
        destination: &Destination,
        status: &TargetStatus,
    ) -> Result<()> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).mark_target(id, destination, status)
    }

    pub async fn target_attempts(&self, id: ActionId, destination: &Destination) -> Result<u32> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).attempts(id, destination)
    }

    /// Move an action to the dead-letter set.
    pub async fn dead_letter_action(&self, id: ActionId, reason: &str) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).dead_letter(id, reason)
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).list_dead_letters()
    }

    pub async fn discard_dead_letter(&self, id: ActionId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).discard_dead_letter(id)
    }

    /// Drop every queued action. Local snapshots are kept.
    pub async fn clear_actions(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).clear()
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).len()
    }

    pub async fn dead_letter_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteActionQueue::new(db.connection()).dead_letter_count()
    }

    /// Plan and apply a reconcile in a single transaction.
    ///
    /// `plan` sees the current local entries and the ids with queued or
    /// dead-lettered actions; its result is written before the lock is
    /// released.
    pub async fn reconcile<F>(&self, plan: F) -> Result<ReconcilePlan>
    where
        F: FnOnce(&[Entry], &HashSet<EntryId>) -> ReconcilePlan + Send,
    {
        let db = self.db.lock().await;
        in_transaction(db.connection(), |conn| {
            let store = SqliteLocalStore::new(conn);
            let queue = SqliteActionQueue::new(conn);

            let local = store.get_all()?;
            let mut dirty = queue.outstanding_entry_ids()?;
            dirty.extend(queue.dead_lettered_entry_ids()?);
            let plan = plan(&local, &dirty);

            store.put_all(&plan.upserts)?;
            for id in &plan.removals {
                store.delete(id)?;
            }
            Ok(plan)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::plan_reconcile;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn record_create_stores_entry_and_queues_action() {
        let storage = StorageService::open_in_memory().unwrap();
        let entry = Entry::new("Sunset", "calm");

        let queued = storage
            .record_mutation(&Mutation::Create(entry.clone()))
            .await
            .unwrap();

        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].mutation, Mutation::Create(entry.clone()));
        assert_eq!(storage.get_entry(&entry.id).await.unwrap(), Some(entry));
        assert_eq!(storage.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_mutations_leave_no_trace() {
        let storage = StorageService::open_in_memory().unwrap();

        let blank = Entry::new("  ", "calm");
        let result = storage.record_mutation(&Mutation::Create(blank)).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let unknown = Entry::new("Never created", "calm");
        let result = storage.record_mutation(&Mutation::Update(unknown)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        assert!(storage.list_entries().await.unwrap().is_empty());
        assert_eq!(storage.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_create_is_rejected() {
        let storage = StorageService::open_in_memory().unwrap();
        let entry = Entry::new("Once", "ok");
        storage
            .record_mutation(&Mutation::Create(entry.clone()))
            .await
            .unwrap();

        let result = storage.record_mutation(&Mutation::Create(entry)).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(storage.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_targets_follow_the_local_snapshot() {
        let storage = StorageService::open_in_memory().unwrap();
        let family = Destination::group("family").unwrap();
        let entry = Entry::new("Shared", "warm")
            .with_targets([Destination::Private, family.clone()]);
        storage
            .record_mutation(&Mutation::Create(entry.clone()))
            .await
            .unwrap();

        let queued = storage
            .record_mutation(&Mutation::Delete(entry.id))
            .await
            .unwrap();
        assert_eq!(
            queued[0].destinations(),
            BTreeSet::from([Destination::Private, family])
        );
        assert!(storage.get_entry(&entry.id).await.unwrap().is_none());

        let unknown = storage
            .record_mutation(&Mutation::Delete(EntryId::new()))
            .await
            .unwrap();
        assert_eq!(
            unknown[0].destinations(),
            BTreeSet::from([Destination::Private])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_dropping_a_group_queues_a_removal() {
        let storage = StorageService::open_in_memory().unwrap();
        let family = Destination::group("family").unwrap();
        let entry = Entry::new("Trip", "excited")
            .with_targets([Destination::Private, family.clone()]);
        storage
            .record_mutation(&Mutation::Create(entry.clone()))
            .await
            .unwrap();

        let narrowed = entry.clone().with_targets([Destination::Private]);
        let queued = storage
            .record_mutation(&Mutation::Update(narrowed.clone()))
            .await
            .unwrap();

        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].mutation, Mutation::Update(narrowed));
        assert_eq!(queued[1].mutation, Mutation::Delete(entry.id));
        assert_eq!(queued[1].destinations(), BTreeSet::from([family]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_changing_private_target_splits_actions() {
        let storage = StorageService::open_in_memory().unwrap();
        let family = Destination::group("family").unwrap();
        let entry = Entry::new("Picnic", "sunny").with_targets([family.clone()]);
        storage
            .record_mutation(&Mutation::Create(entry.clone()))
            .await
            .unwrap();

        let widened = entry
            .clone()
            .with_targets([Destination::Private, family.clone()]);
        let queued = storage
            .record_mutation(&Mutation::Update(widened.clone()))
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].mutation, Mutation::Update(widened.clone()));
        assert_eq!(queued[0].destinations(), BTreeSet::from([family.clone()]));
        assert_eq!(queued[1].mutation, Mutation::Create(widened));
        assert_eq!(
            queued[1].destinations(),
            BTreeSet::from([Destination::Private])
        );

        let narrowed = entry.clone().with_targets([family.clone()]);
        let queued = storage
            .record_mutation(&Mutation::Update(narrowed.clone()))
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].mutation, Mutation::Update(narrowed));
        assert_eq!(queued[1].mutation, Mutation::Delete(entry.id));
        assert_eq!(
            queued[1].destinations(),
            BTreeSet::from([Destination::Private])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconcile_applies_plan_atomically() {
        let storage = StorageService::open_in_memory().unwrap();

        let clean = Entry::new("clean", "ok");
        storage.put_entry(&clean).await.unwrap();
        let dirty = Entry::new("dirty", "ok");
        storage
            .record_mutation(&Mutation::Create(dirty.clone()))
            .await
            .unwrap();

        let mut remote_clean = clean.clone();
        remote_clean.caption = "clean, edited remotely".into();
        let mut remote_dirty = dirty.clone();
        remote_dirty.caption = "stale".into();
        let remote = vec![remote_clean.clone(), remote_dirty];

        let plan = storage
            .reconcile(|local, outstanding| plan_reconcile(local, &remote, outstanding))
            .await
            .unwrap();

        assert_eq!(plan.upserts, vec![remote_clean.clone()]);
        assert_eq!(plan.skipped_dirty, 1);
        assert_eq!(
            storage.get_entry(&clean.id).await.unwrap(),
            Some(remote_clean)
        );
        assert_eq!(storage.get_entry(&dirty.id).await.unwrap(), Some(dirty));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("diary.db");

        let storage = StorageService::open_path(&path).unwrap();
        storage.put_entry(&Entry::new("hello", "ok")).await.unwrap();

        assert!(path.exists());
        assert_eq!(storage.db_path(), Some(path.as_path()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_quarantines_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diary.db");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();

        let storage = StorageService::open_path(&path).unwrap();
        assert!(storage.list_entries().await.unwrap().is_empty());

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("diary.db.corrupt-")
            })
            .count();
        assert_eq!(backups, 1);
    }
}
