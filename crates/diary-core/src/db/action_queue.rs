//! Durable FIFO queue of unconfirmed mutations

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::models::{
    ActionId, ActionKind, DeadLetter, Destination, EntryId, Mutation, PendingAction, TargetStatus,
};
use crate::util::unix_millis_now;
use rusqlite::{params, Connection, OptionalExtension};

use super::in_transaction;

/// Trait for pending action storage
///
/// Actions are append-only: the stored mutation never changes. Delivery
/// progress lives in a per-destination ledger next to it.
pub trait ActionQueue {
    /// Append a mutation addressed to `targets`, returning its handle
    fn enqueue(&self, mutation: &Mutation, targets: &BTreeSet<Destination>) -> Result<ActionId>;

    /// All queued actions in enqueue order
    fn list_all(&self) -> Result<Vec<PendingAction>>;

    /// A single queued action
    fn get(&self, id: ActionId) -> Result<Option<PendingAction>>;

    /// Remove one action. Returns whether it was still queued.
    fn remove(&self, id: ActionId) -> Result<bool>;

    /// Drop every queued action
    fn clear(&self) -> Result<usize>;

    /// Number of queued actions
    fn len(&self) -> Result<usize>;

    /// Whether the queue is empty
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ids of entries with at least one queued action
    fn outstanding_entry_ids(&self) -> Result<HashSet<EntryId>>;

    /// Ids of entries with at least one dead-lettered action
    fn dead_lettered_entry_ids(&self) -> Result<HashSet<EntryId>>;

    /// Handle of the oldest queued action for `entry_id`
    fn earliest_for(&self, entry_id: &EntryId) -> Result<Option<ActionId>>;

    /// Record the latest delivery status for one destination of an action
    fn mark_target(
        &self,
        id: ActionId,
        destination: &Destination,
        status: &TargetStatus,
    ) -> Result<()>;

    /// Delivery attempts recorded for one destination of an action
    fn attempts(&self, id: ActionId, destination: &Destination) -> Result<u32>;

    /// Move an action out of the queue into the dead-letter set
    fn dead_letter(&self, id: ActionId, reason: &str) -> Result<bool>;

    /// Dead-lettered actions, most recent first
    fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Permanently forget a dead-lettered action
    fn discard_dead_letter(&self, id: ActionId) -> Result<bool>;

    /// Number of dead-lettered actions
    fn dead_letter_count(&self) -> Result<usize>;
}

/// `SQLite` implementation of `ActionQueue`
pub struct SqliteActionQueue<'a> {
    conn: &'a Connection,
}

/// Raw `pending_actions` / `dead_letters` row
struct ActionRow {
    id: i64,
    kind: String,
    payload: String,
    targets: String,
    enqueued_at: i64,
}

impl ActionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            payload: row.get(2)?,
            targets: row.get(3)?,
            enqueued_at: row.get(4)?,
        })
    }

    /// Decode a queued row; every destination starts as `Pending`
    fn into_action(self) -> Result<PendingAction> {
        let kind: ActionKind = self.kind.parse()?;
        let mutation = Mutation::from_parts(kind, &self.payload)?;
        let destinations: BTreeSet<Destination> = serde_json::from_str(&self.targets)?;
        Ok(PendingAction {
            id: ActionId::from_raw(self.id),
            mutation,
            targets: destinations
                .into_iter()
                .map(|destination| (destination, TargetStatus::Pending))
                .collect(),
            enqueued_at: self.enqueued_at,
        })
    }
}

const ACTION_COLUMNS: &str = "id, kind, payload, targets, enqueued_at";

impl<'a> SqliteActionQueue<'a> {
    /// Create a new queue over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_status(status: &str, reason: Option<String>) -> Result<TargetStatus> {
        match status {
            "pending" => Ok(TargetStatus::Pending),
            "applied" => Ok(TargetStatus::Applied),
            "failed" => Ok(TargetStatus::Failed(reason.unwrap_or_default())),
            other => Err(Error::Database(format!("unknown target status: {other}"))),
        }
    }

    fn status_columns(status: &TargetStatus) -> (&'static str, Option<&str>) {
        match status {
            TargetStatus::Pending => ("pending", None),
            TargetStatus::Applied => ("applied", None),
            TargetStatus::Failed(reason) => ("failed", Some(reason.as_str())),
        }
    }

    /// Overlay ledger statuses onto freshly decoded actions
    fn load_statuses(&self, actions: &mut [PendingAction]) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }

        let index: HashMap<i64, usize> = actions
            .iter()
            .enumerate()
            .map(|(position, action)| (action.id.as_i64(), position))
            .collect();

        let mut stmt = self
            .conn
            .prepare("SELECT action_id, destination, status, reason FROM action_targets")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (action_id, destination, status, reason) in rows {
            let Some(&position) = index.get(&action_id) else {
                continue;
            };
            let destination: Destination = destination.parse()?;
            let status = Self::parse_status(&status, reason)?;
            if let Some(slot) = actions[position].targets.get_mut(&destination) {
                *slot = status;
            }
        }

        Ok(())
    }

    fn entry_ids(&self, sql: &str) -> Result<HashSet<EntryId>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        ids.iter()
            .map(|raw| {
                raw.parse()
                    .map_err(|_| Error::Database(format!("invalid entry id in queue: {raw}")))
            })
            .collect()
    }

    fn delete_action(conn: &Connection, id: ActionId) -> Result<bool> {
        conn.execute(
            "DELETE FROM action_targets WHERE action_id = ?1",
            params![id.as_i64()],
        )?;
        let rows = conn.execute(
            "DELETE FROM pending_actions WHERE id = ?1",
            params![id.as_i64()],
        )?;
        Ok(rows > 0)
    }
}

impl ActionQueue for SqliteActionQueue<'_> {
    fn enqueue(&self, mutation: &Mutation, targets: &BTreeSet<Destination>) -> Result<ActionId> {
        if targets.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} for entry {} has no destinations",
                mutation.kind(),
                mutation.entry_id()
            )));
        }

        let payload = mutation.payload_json()?;
        let targets_json = serde_json::to_string(targets)?;
        let now = unix_millis_now();

        in_transaction(self.conn, |conn| {
            conn.execute(
                "INSERT INTO pending_actions (kind, entry_id, payload, targets, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    mutation.kind().as_str(),
                    mutation.entry_id().as_str(),
                    payload,
                    targets_json,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();

            for destination in targets {
                conn.execute(
                    "INSERT INTO action_targets (action_id, destination, status, updated_at)
                     VALUES (?1, ?2, 'pending', ?3)",
                    params![id, destination.to_string(), now],
                )?;
            }

            tracing::debug!(
                "Queued {} for entry {} as #{id}",
                mutation.kind(),
                mutation.entry_id()
            );
            Ok(ActionId::from_raw(id))
        })
    }

    fn list_all(&self) -> Result<Vec<PendingAction>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ACTION_COLUMNS} FROM pending_actions ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map([], ActionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut actions = rows
            .into_iter()
            .map(ActionRow::into_action)
            .collect::<Result<Vec<_>>>()?;
        self.load_statuses(&mut actions)?;
        Ok(actions)
    }

    fn get(&self, id: ActionId) -> Result<Option<PendingAction>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {ACTION_COLUMNS} FROM pending_actions WHERE id = ?1"),
                params![id.as_i64()],
                ActionRow::from_row,
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut actions = [row.into_action()?];
        self.load_statuses(&mut actions)?;
        let [action] = actions;
        Ok(Some(action))
    }

    fn remove(&self, id: ActionId) -> Result<bool> {
        in_transaction(self.conn, |conn| Self::delete_action(conn, id))
    }

    fn clear(&self) -> Result<usize> {
        in_transaction(self.conn, |conn| {
            conn.execute("DELETE FROM action_targets", [])?;
            let rows = conn.execute("DELETE FROM pending_actions", [])?;
            Ok(rows)
        })
    }

    fn len(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM pending_actions", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn outstanding_entry_ids(&self) -> Result<HashSet<EntryId>> {
        self.entry_ids("SELECT DISTINCT entry_id FROM pending_actions")
    }

    fn dead_lettered_entry_ids(&self) -> Result<HashSet<EntryId>> {
        self.entry_ids("SELECT DISTINCT entry_id FROM dead_letters")
    }

    fn earliest_for(&self, entry_id: &EntryId) -> Result<Option<ActionId>> {
        let id: Option<i64> = self.conn.query_row(
            "SELECT MIN(id) FROM pending_actions WHERE entry_id = ?1",
            params![entry_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(id.map(ActionId::from_raw))
    }

    fn mark_target(
        &self,
        id: ActionId,
        destination: &Destination,
        status: &TargetStatus,
    ) -> Result<()> {
        let (status, reason) = Self::status_columns(status);
        let rows = self.conn.execute(
            "UPDATE action_targets
             SET status = ?1, reason = ?2, updated_at = ?3,
                 attempts = attempts + CASE WHEN ?1 = 'pending' THEN 0 ELSE 1 END
             WHERE action_id = ?4 AND destination = ?5",
            params![
                status,
                reason,
                unix_millis_now(),
                id.as_i64(),
                destination.to_string()
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!(
                "action {id} has no destination {destination}"
            )));
        }
        Ok(())
    }

    fn attempts(&self, id: ActionId, destination: &Destination) -> Result<u32> {
        let attempts: Option<u32> = self
            .conn
            .query_row(
                "SELECT attempts FROM action_targets WHERE action_id = ?1 AND destination = ?2",
                params![id.as_i64(), destination.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        attempts.ok_or_else(|| {
            Error::NotFound(format!("action {id} has no destination {destination}"))
        })
    }

    fn dead_letter(&self, id: ActionId, reason: &str) -> Result<bool> {
        in_transaction(self.conn, |conn| {
            let queue = SqliteActionQueue::new(conn);
            let Some(action) = queue.get(id)? else {
                return Ok(false);
            };

            conn.execute(
                "INSERT OR REPLACE INTO dead_letters
                    (id, kind, entry_id, payload, targets, enqueued_at, reason, dead_lettered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.as_i64(),
                    action.kind().as_str(),
                    action.entry_id().as_str(),
                    action.mutation.payload_json()?,
                    serde_json::to_string(&action.targets)?,
                    action.enqueued_at,
                    reason,
                    unix_millis_now()
                ],
            )?;
            Self::delete_action(conn, id)
        })
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ACTION_COLUMNS}, reason, dead_lettered_at
             FROM dead_letters
             ORDER BY dead_lettered_at DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    ActionRow::from_row(row)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(row, reason, dead_lettered_at)| {
                // Dead letters keep the full status map, not just the destination set
                let kind: ActionKind = row.kind.parse()?;
                let action = PendingAction {
                    id: ActionId::from_raw(row.id),
                    mutation: Mutation::from_parts(kind, &row.payload)?,
                    targets: serde_json::from_str::<BTreeMap<Destination, TargetStatus>>(
                        &row.targets,
                    )?,
                    enqueued_at: row.enqueued_at,
                };
                Ok(DeadLetter {
                    action,
                    reason,
                    dead_lettered_at,
                })
            })
            .collect()
    }

    fn discard_dead_letter(&self, id: ActionId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM dead_letters WHERE id = ?1", params![id.as_i64()])?;
        Ok(rows > 0)
    }

    fn dead_letter_count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Entry;
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn private() -> BTreeSet<Destination> {
        BTreeSet::from([Destination::Private])
    }

    #[test]
    fn test_enqueue_and_list_in_fifo_order() {
        let db = setup();
        let queue = SqliteActionQueue::new(db.connection());

        let entry = Entry::new("Picnic", "happy");
        let first = queue
            .enqueue(&Mutation::Create(entry.clone()), &private())
            .unwrap();
        let second = queue
            .enqueue(&Mutation::Update(entry.clone()), &private())
            .unwrap();
        let third = queue
            .enqueue(&Mutation::Delete(entry.id), &private())
            .unwrap();

        let actions = queue.list_all().unwrap();
        let ids: Vec<_> = actions.iter().map(|action| action.id).collect();
        assert_eq!(ids, vec![first, second, third]);
        assert_eq!(actions[0].kind(), ActionKind::Create);
        assert_eq!(actions[2].mutation, Mutation::Delete(entry.id));
        assert_eq!(
            actions[0].targets,
            BTreeMap::from([(Destination::Private, TargetStatus::Pending)])
        );
    }

    #[test]
    fn test_enqueue_requires_targets() {
        let db = setup();
        let queue = SqliteActionQueue::new(db.connection());

        let result = queue.enqueue(&Mutation::Delete(EntryId::new()), &BTreeSet::new());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_remove_is_durable_and_handles_stay_unique() {
        let db = setup();
        let queue = SqliteActionQueue::new(db.connection());

        let id = queue
            .enqueue(&Mutation::Delete(EntryId::new()), &private())
            .unwrap();
        assert!(queue.remove(id).unwrap());
        assert!(!queue.remove(id).unwrap());
        assert!(queue.get(id).unwrap().is_none());

        let next = queue
            .enqueue(&Mutation::Delete(EntryId::new()), &private())
            .unwrap();
        assert!(next > id);
    }

    #[test]
    fn test_mark_target_tracks_each_destination() {
        let db = setup();
        let queue = SqliteActionQueue::new(db.connection());

        let family = Destination::group("family").unwrap();
        let targets = BTreeSet::from([Destination::Private, family.clone()]);
        let entry = Entry::new("Birthday", "joyful").with_targets(targets.clone());
        let id = queue.enqueue(&Mutation::Create(entry), &targets).unwrap();

        queue
            .mark_target(id, &Destination::Private, &TargetStatus::Applied)
            .unwrap();
        queue
            .mark_target(id, &family, &TargetStatus::Failed("HTTP 503".into()))
            .unwrap();

        let action = queue.get(id).unwrap().unwrap();
        assert_eq!(action.targets[&Destination::Private], TargetStatus::Applied);
        assert_eq!(
            action.targets[&family],
            TargetStatus::Failed("HTTP 503".into())
        );
        assert_eq!(action.remaining_targets().collect::<Vec<_>>(), vec![&family]);

        queue
            .mark_target(id, &family, &TargetStatus::Failed("timeout".into()))
            .unwrap();
        assert_eq!(queue.attempts(id, &family).unwrap(), 2);
        assert_eq!(queue.attempts(id, &Destination::Private).unwrap(), 1);
    }

    #[test]
    fn test_mark_target_unknown_destination() {
        let db = setup();
        let queue = SqliteActionQueue::new(db.connection());

        let id = queue
            .enqueue(&Mutation::Delete(EntryId::new()), &private())
            .unwrap();
        let result = queue.mark_target(
            id,
            &Destination::group("strangers").unwrap(),
            &TargetStatus::Applied,
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_outstanding_entry_ids() {
        let db = setup();
        let queue = SqliteActionQueue::new(db.connection());

        let a = EntryId::new();
        let b = EntryId::new();
        queue.enqueue(&Mutation::Delete(a), &private()).unwrap();
        queue.enqueue(&Mutation::Delete(a), &private()).unwrap();
        queue.enqueue(&Mutation::Delete(b), &private()).unwrap();

        assert_eq!(queue.outstanding_entry_ids().unwrap(), HashSet::from([a, b]));
        assert_eq!(queue.len().unwrap(), 3);

        let earliest = queue.list_all().unwrap()[0].id;
        assert_eq!(queue.earliest_for(&a).unwrap(), Some(earliest));
        assert_eq!(queue.earliest_for(&EntryId::new()).unwrap(), None);
    }

    #[test]
    fn test_dead_letter_moves_action_out_of_queue() {
        let db = setup();
        let queue = SqliteActionQueue::new(db.connection());

        let entry = Entry::new("Rejected", "angry");
        let id = queue
            .enqueue(&Mutation::Update(entry.clone()), &private())
            .unwrap();
        queue
            .mark_target(
                id,
                &Destination::Private,
                &TargetStatus::Failed("HTTP 422".into()),
            )
            .unwrap();

        assert!(queue.dead_letter(id, "HTTP 422: caption too long").unwrap());
        assert!(queue.is_empty().unwrap());

        let letters = queue.list_dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].action.id, id);
        assert_eq!(letters[0].action.mutation, Mutation::Update(entry.clone()));
        assert_eq!(letters[0].reason, "HTTP 422: caption too long");
        assert_eq!(
            letters[0].action.targets[&Destination::Private],
            TargetStatus::Failed("HTTP 422".into())
        );

        assert_eq!(queue.dead_letter_count().unwrap(), 1);
        assert_eq!(
            queue.dead_lettered_entry_ids().unwrap(),
            HashSet::from([entry.id])
        );
        assert!(queue.discard_dead_letter(id).unwrap());
        assert!(queue.list_dead_letters().unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let db = setup();
        let queue = SqliteActionQueue::new(db.connection());

        queue
            .enqueue(&Mutation::Delete(EntryId::new()), &private())
            .unwrap();
        queue
            .enqueue(&Mutation::Delete(EntryId::new()), &private())
            .unwrap();

        assert_eq!(queue.clear().unwrap(), 2);
        assert!(queue.list_all().unwrap().is_empty());
    }
}
