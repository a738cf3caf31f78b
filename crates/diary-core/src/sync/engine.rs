//! Sync coordinator: immediate push, queue drain, reconcile.
//!
//! Every local write lands in the store and the action queue before any
//! network traffic. Delivery happens either right away (online, nothing
//! older queued for the entry) or during a pass triggered by a reconnect
//! edge, the periodic tick, or [`SyncEngine::sync_now`].
//!
//! A pass drains the queue in FIFO order and then reconciles clean entries
//! against a full remote snapshot. Only one pass (or immediate push) runs at
//! a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::connectivity::{Connectivity, ConnectivityMonitor};
use super::reconcile::plan_reconcile;
use super::remote::{apply_mutation, FailureClass, RemoteError, RemoteResult, RemoteStore};
use crate::config::EngineConfig;
use crate::models::{
    ActionId, DeadLetter, Destination, Entry, EntryId, Mutation, PendingAction, TargetStatus,
};
use crate::services::StorageService;
use crate::state::{SyncIssue, SyncPhase, SyncStatus};
use crate::util::unix_millis_now;
use crate::{Error, Result};

/// Result of a local save as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Saved locally and confirmed by every destination
    Synced,
    /// Saved locally; delivery is queued for a later pass
    Pending,
    /// Saved locally, but a destination refused it and the action was
    /// dead-lettered
    Rejected,
}

/// Counters for one drain + reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Actions delivered to every target and removed from the queue
    pub applied: usize,
    /// Actions kept after a retryable failure
    pub retained: usize,
    /// Actions skipped to preserve per-entry order
    pub deferred: usize,
    pub dead_lettered: usize,
    /// Local entries replaced or inserted from the remote snapshot
    pub refreshed: usize,
    /// Local entries removed because they are gone remotely
    pub removed: usize,
    /// Whether the remote snapshot was fetched and merged
    pub reconciled: bool,
}

impl SyncReport {
    const fn is_clean(&self) -> bool {
        self.retained == 0 && self.deferred == 0 && self.dead_lettered == 0 && self.reconciled
    }
}

/// What happened to one action during delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Applied,
    Retained,
    DeadLettered,
    /// The action left the queue while it was being delivered
    Discarded,
}

/// Holds the single pass slot and returns the phase to idle on drop.
struct PassGuard<'a> {
    flag: &'a AtomicBool,
    status: &'a watch::Sender<SyncStatus>,
}

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool, status: &'a watch::Sender<SyncStatus>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag, status })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.status.send_if_modified(|status| {
            let changed = status.phase != SyncPhase::Idle;
            status.phase = SyncPhase::Idle;
            changed
        });
        self.flag.store(false, Ordering::Release);
    }
}

/// Local-first sync coordinator
pub struct SyncEngine {
    storage: StorageService,
    remote: Arc<dyn RemoteStore>,
    connectivity: watch::Receiver<Connectivity>,
    config: EngineConfig,
    status: watch::Sender<SyncStatus>,
    in_progress: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        storage: StorageService,
        remote: Arc<dyn RemoteStore>,
        connectivity: &ConnectivityMonitor,
        config: EngineConfig,
    ) -> Self {
        let (status, _rx) = watch::channel(SyncStatus::new(connectivity.current()));
        Self {
            storage,
            remote,
            connectivity: connectivity.subscribe(),
            config,
            status,
            in_progress: AtomicBool::new(false),
        }
    }

    pub const fn storage(&self) -> &StorageService {
        &self.storage
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    /// Save a new entry locally and try to deliver it.
    pub async fn create_entry(&self, entry: Entry) -> Result<SaveOutcome> {
        self.save(Mutation::Create(entry)).await
    }

    /// Replace an existing entry locally and try to deliver the change.
    pub async fn update_entry(&self, entry: Entry) -> Result<SaveOutcome> {
        self.save(Mutation::Update(entry)).await
    }

    /// Delete an entry locally and try to deliver the removal.
    pub async fn delete_entry(&self, id: EntryId) -> Result<SaveOutcome> {
        self.save(Mutation::Delete(id)).await
    }

    async fn save(&self, mutation: Mutation) -> Result<SaveOutcome> {
        let queued = self.storage.record_mutation(&mutation).await?;
        tracing::debug!(
            "Recorded {} for entry {} ({} action(s) queued)",
            mutation.kind(),
            mutation.entry_id(),
            queued.len()
        );

        let outcome = self.push_now(&queued).await;
        self.refresh_status().await?;
        outcome
    }

    /// Deliver freshly queued actions right away when nothing blocks them.
    async fn push_now(&self, queued: &[PendingAction]) -> Result<SaveOutcome> {
        if !self.is_online() {
            return Ok(SaveOutcome::Pending);
        }
        let Some(_guard) = PassGuard::acquire(&self.in_progress, &self.status) else {
            tracing::debug!("Sync pass running; leaving new action(s) queued");
            return Ok(SaveOutcome::Pending);
        };
        self.set_phase(SyncPhase::Draining);

        let mut outcome = SaveOutcome::Synced;
        for action in queued {
            let earliest = self.storage.earliest_action_for(&action.entry_id()).await?;
            if earliest != Some(action.id) {
                tracing::debug!(
                    "Entry {} has older queued actions; deferring {}",
                    action.entry_id(),
                    action.id
                );
                return Ok(SaveOutcome::Pending);
            }

            match self.deliver(action).await? {
                Delivery::Applied | Delivery::Discarded => {}
                Delivery::Retained => return Ok(SaveOutcome::Pending),
                Delivery::DeadLettered => outcome = SaveOutcome::Rejected,
            }
        }
        Ok(outcome)
    }

    /// Run one drain + reconcile pass.
    ///
    /// Returns `None` when another pass already holds the slot. Remote
    /// failures are recorded in the status; only local storage errors are
    /// returned.
    pub async fn sync_now(&self) -> Result<Option<SyncReport>> {
        let Some(_guard) = PassGuard::acquire(&self.in_progress, &self.status) else {
            tracing::debug!("Sync pass already in progress");
            return Ok(None);
        };

        let mut report = SyncReport::default();
        if self.is_online() {
            let result = async {
                self.drain(&mut report).await?;
                self.reconcile(&mut report).await
            }
            .await;
            self.set_phase(SyncPhase::Idle);
            result?;
        } else {
            tracing::debug!("Offline; skipping sync pass");
        }

        if report.is_clean() {
            self.status.send_if_modified(|status| status.last_issue.take().is_some());
        }
        self.refresh_status().await?;
        Ok(Some(report))
    }

    async fn drain(&self, report: &mut SyncReport) -> Result<()> {
        self.set_phase(SyncPhase::Draining);

        let actions = self.storage.list_actions().await?;
        if !actions.is_empty() {
            tracing::info!("Draining {} queued action(s)", actions.len());
        }

        let mut blocked: HashSet<EntryId> = HashSet::new();
        for action in &actions {
            if blocked.contains(&action.entry_id()) || !self.is_online() {
                report.deferred += 1;
                continue;
            }

            match self.deliver(action).await? {
                Delivery::Applied => report.applied += 1,
                Delivery::Retained => {
                    report.retained += 1;
                    blocked.insert(action.entry_id());
                }
                Delivery::DeadLettered => report.dead_lettered += 1,
                Delivery::Discarded => {}
            }
            self.refresh_status().await?;
        }
        Ok(())
    }

    /// Attempt every outstanding target of one action and settle it.
    async fn deliver(&self, action: &PendingAction) -> Result<Delivery> {
        let mut retryable: Option<RemoteError> = None;
        let mut fatal: Option<RemoteError> = None;

        let remaining: Vec<Destination> = action.remaining_targets().cloned().collect();
        for destination in &remaining {
            tracing::debug!(
                "Delivering {} {} for entry {} to {}",
                action.id,
                action.kind(),
                action.entry_id(),
                destination
            );

            let status = match self.call_remote(&action.mutation, destination).await {
                Ok(()) => TargetStatus::Applied,
                Err(error) => {
                    self.record_issue(Some(action.entry_id()), Some(destination), &error);
                    let status = TargetStatus::Failed(error.to_string());
                    match error.class() {
                        FailureClass::Retryable => {
                            tracing::warn!(
                                "{} to {} failed, will retry: {}",
                                action.id,
                                destination,
                                error
                            );
                            retryable.get_or_insert(error);
                        }
                        FailureClass::Fatal => {
                            fatal.get_or_insert(error);
                        }
                    }
                    status
                }
            };

            match self.storage.mark_target(action.id, destination, &status).await {
                Ok(()) => {}
                Err(Error::NotFound(_)) => {
                    tracing::debug!("{} left the queue during delivery", action.id);
                    return Ok(Delivery::Discarded);
                }
                Err(error) => return Err(error),
            }
        }

        if let Some(error) = fatal {
            tracing::error!(
                "{} for entry {} was rejected and moved to dead letters: {}",
                action.id,
                action.entry_id(),
                error
            );
            self.storage
                .dead_letter_action(action.id, &error.to_string())
                .await?;
            return Ok(Delivery::DeadLettered);
        }
        if retryable.is_some() {
            return Ok(Delivery::Retained);
        }

        self.storage.remove_action(action.id).await?;
        tracing::debug!("{} applied to every destination", action.id);
        Ok(Delivery::Applied)
    }

    async fn call_remote(&self, mutation: &Mutation, destination: &Destination) -> RemoteResult<()> {
        let timeout = self.config.request_timeout;
        tokio::time::timeout(
            timeout,
            apply_mutation(self.remote.as_ref(), mutation, destination),
        )
        .await
        .unwrap_or(Err(RemoteError::Timeout(timeout)))
    }

    async fn reconcile(&self, report: &mut SyncReport) -> Result<()> {
        if !self.is_online() {
            return Ok(());
        }
        self.set_phase(SyncPhase::Reconciling);

        let timeout = self.config.request_timeout;
        let fetched = tokio::time::timeout(timeout, self.remote.fetch_all())
            .await
            .unwrap_or(Err(RemoteError::Timeout(timeout)));
        let remote = match fetched {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!("Skipping reconcile, remote snapshot unavailable: {error}");
                self.record_issue(None, None, &error);
                return Ok(());
            }
        };

        let plan = self
            .storage
            .reconcile(|local, dirty| plan_reconcile(local, &remote, dirty))
            .await?;
        tracing::info!(
            "Reconciled {} remote entries: {} refreshed, {} removed, {} left pending",
            remote.len(),
            plan.upserts.len(),
            plan.removals.len(),
            plan.skipped_dirty
        );

        report.refreshed = plan.upserts.len();
        report.removed = plan.removals.len();
        report.reconciled = true;
        self.status.send_modify(|status| {
            status.last_synced_at = Some(unix_millis_now());
        });
        Ok(())
    }

    /// Drive passes from connectivity edges and the periodic tick until the
    /// connectivity monitor is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut connectivity = self.connectivity.clone();
        let mut ticker = self.config.sync_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        if self.is_online() {
            self.run_pass("startup").await;
        }

        loop {
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        tracing::info!("Connectivity monitor closed; stopping sync loop");
                        break;
                    }
                    let state = *connectivity.borrow_and_update();
                    self.status.send_if_modified(|status| {
                        let changed = status.connectivity != state;
                        status.connectivity = state;
                        changed
                    });
                    if state.is_online() {
                        self.run_pass("reconnect").await;
                    }
                }
                () = next_tick(ticker.as_mut()) => {
                    if self.is_online() {
                        self.run_pass("interval").await;
                    }
                }
            }
        }
    }

    /// Spawn [`SyncEngine::run`] on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    async fn run_pass(&self, trigger: &str) {
        match self.sync_now().await {
            Ok(Some(report)) => tracing::info!("Sync pass ({trigger}) finished: {report:?}"),
            Ok(None) => {}
            Err(error) => tracing::error!("Sync pass ({trigger}) failed: {error}"),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Recount queued and dead-lettered actions and republish the status.
    pub async fn refresh_status(&self) -> Result<SyncStatus> {
        let pending_actions = self.storage.pending_count().await?;
        let dead_letters = self.storage.dead_letter_count().await?;
        let connectivity = *self.connectivity.borrow();

        self.status.send_if_modified(|status| {
            let before = (status.pending_actions, status.dead_letters, status.connectivity);
            status.pending_actions = pending_actions;
            status.dead_letters = dead_letters;
            status.connectivity = connectivity;
            before != (pending_actions, dead_letters, connectivity)
        });
        Ok(self.status())
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.status.send_if_modified(|status| {
            if status.phase == phase {
                return false;
            }
            tracing::info!("Sync phase {:?} -> {:?}", status.phase, phase);
            status.phase = phase;
            true
        });
    }

    fn record_issue(
        &self,
        entry_id: Option<EntryId>,
        destination: Option<&Destination>,
        error: &RemoteError,
    ) {
        let issue = SyncIssue {
            entry_id,
            destination: destination.cloned(),
            class: error.class(),
            message: error.to_string(),
            at: unix_millis_now(),
        };
        self.status.send_modify(|status| status.last_issue = Some(issue));
    }

    /// Local entries, newest first.
    pub async fn entries(&self) -> Result<Vec<Entry>> {
        self.storage.list_entries().await
    }

    pub async fn entry(&self, id: &EntryId) -> Result<Option<Entry>> {
        self.storage.get_entry(id).await
    }

    /// Queued actions in delivery order.
    pub async fn pending_actions(&self) -> Result<Vec<PendingAction>> {
        self.storage.list_actions().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.storage.list_dead_letters().await
    }

    pub async fn discard_dead_letter(&self, id: ActionId) -> Result<bool> {
        let removed = self.storage.discard_dead_letter(id).await?;
        self.refresh_status().await?;
        Ok(removed)
    }

    /// Drop every queued action, e.g. on sign-out. Local entries stay.
    pub async fn discard_pending_actions(&self) -> Result<usize> {
        let cleared = self.storage.clear_actions().await?;
        if cleared > 0 {
            tracing::warn!("Discarded {cleared} unsynced action(s)");
        }
        self.refresh_status().await?;
        Ok(cleared)
    }
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
