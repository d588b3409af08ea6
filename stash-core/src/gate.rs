//! Facade the protocol layer talks to: gated writes, ungated reads.

use crate::committer::{HistoryCommitter, PushTarget};
use crate::config::{StashConfig, SyncConfig};
use crate::content::{self, ContentStore};
use crate::error::Result;
use crate::events::{ChangeEvent, EventBus};
use crate::history::{CommitId, HistoryBackend};
use crate::interlock::Interlock;
use crate::lock::{LockManager, TxnStatus};
use crate::staging::StagingLayer;
use crate::sync::SyncScheduler;
use crate::transaction::{Holder, Operation, TxnId};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub struct ContentGate {
    lock: Arc<LockManager>,
    staging: Arc<StagingLayer>,
    committer: HistoryCommitter,
    history: Arc<dyn HistoryBackend>,
    events: EventBus,
    lock_wait: Duration,
    watchdog_interval: Duration,
}

impl ContentGate {
    pub fn new(
        store: Arc<dyn ContentStore>,
        history: Arc<dyn HistoryBackend>,
        config: &StashConfig,
    ) -> Self {
        Self::build(store, history, config, LockManager::new(config.transaction.ttl()))
    }

    /// A gate that also excludes other processes holding `interlock`.
    pub fn interlocked(
        store: Arc<dyn ContentStore>,
        history: Arc<dyn HistoryBackend>,
        config: &StashConfig,
        interlock: Interlock,
    ) -> Self {
        let lock = LockManager::new(config.transaction.ttl()).with_interlock(interlock);
        Self::build(store, history, config, lock)
    }

    fn build(
        store: Arc<dyn ContentStore>,
        history: Arc<dyn HistoryBackend>,
        config: &StashConfig,
        lock: LockManager,
    ) -> Self {
        let lock = Arc::new(lock);
        let staging = Arc::new(StagingLayer::new(store));
        let events = EventBus::default();

        let mut committer = HistoryCommitter::new(
            Arc::clone(&lock),
            Arc::clone(&staging),
            Arc::clone(&history),
            config.default_author(),
        )
        .with_events(events.clone());
        if config.git.push_after_commit {
            committer = committer.with_push(PushTarget {
                remote: config.sync.remote.clone(),
                branch: config.sync.branch.clone(),
            });
        }

        Self {
            lock,
            staging,
            committer,
            history,
            events,
            lock_wait: config.transaction.lock_wait(),
            watchdog_interval: config.transaction.watchdog_interval(),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock
    }

    pub fn history(&self) -> &Arc<dyn HistoryBackend> {
        &self.history
    }

    // ─────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────

    /// Wait up to `wait_timeout` for the write lock.
    pub async fn begin_transaction(
        &self,
        holder: Holder,
        wait_timeout: Duration,
    ) -> Result<TxnId> {
        self.lock.acquire(holder, wait_timeout).await
    }

    /// [`begin_transaction`](Self::begin_transaction) with the configured wait.
    pub async fn begin(&self, holder: Holder) -> Result<TxnId> {
        self.begin_transaction(holder, self.lock_wait).await
    }

    pub async fn stage(&self, session: &str, id: TxnId, op: Operation) -> Result<()> {
        self.staging.stage(&self.lock, session, id, op).await
    }

    pub async fn stage_create(
        &self,
        session: &str,
        id: TxnId,
        path: &str,
        content: impl Into<Bytes>,
    ) -> Result<()> {
        self.stage(session, id, Operation::create(path, content)).await
    }

    pub async fn stage_update(
        &self,
        session: &str,
        id: TxnId,
        path: &str,
        content: impl Into<Bytes>,
    ) -> Result<()> {
        self.stage(session, id, Operation::update(path, content)).await
    }

    pub async fn stage_delete(&self, session: &str, id: TxnId, path: &str) -> Result<()> {
        self.stage(session, id, Operation::delete(path)).await
    }

    pub async fn stage_move(
        &self,
        session: &str,
        id: TxnId,
        src: &str,
        dest: &str,
    ) -> Result<()> {
        self.stage(session, id, Operation::rename(src, dest)).await
    }

    pub async fn commit_transaction(
        &self,
        session: &str,
        id: TxnId,
        message: &str,
    ) -> Result<CommitId> {
        self.committer.commit(session, id, message).await
    }

    pub fn abort_transaction(&self, session: &str, id: TxnId) -> Result<()> {
        self.committer.abort(session, id)
    }

    pub fn transaction_status(&self, session: &str) -> TxnStatus {
        self.lock.status(session)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────
    // Ungated reads
    // ─────────────────────────────────────────────────────

    pub async fn read(&self, path: &str) -> Result<Bytes> {
        let path = content::normalize_path(path)?;
        Ok(self.staging.store().read(&path).await?)
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let path = content::normalize_path(path)?;
        Ok(self.staging.store().exists(&path).await?)
    }

    pub async fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.staging.store().list_files().await?)
    }

    // ─────────────────────────────────────────────────────
    // Background tasks
    // ─────────────────────────────────────────────────────

    pub fn spawn_watchdog(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.lock.spawn_watchdog(self.watchdog_interval, shutdown)
    }

    /// A scheduler pulling into this gate's history under its lock.
    pub fn sync_scheduler(&self, config: SyncConfig) -> SyncScheduler {
        SyncScheduler::new(
            Arc::clone(&self.lock),
            Arc::clone(&self.history),
            config,
            self.events.clone(),
        )
    }
}
