//! Single-slot write lock with a FIFO wait queue.
//!
//! The slot is held either by a [`Transaction`] or by a sync lease. Waiters
//! park on a oneshot channel and are granted strictly in arrival order. The
//! internal mutex is never held across an `.await`.
//!
//! With an [`Interlock`] installed, a granted slot also claims the
//! cross-process file lock before it is handed to the caller, and gives it
//! back when the slot is released.

use crate::error::{Result, TxnError};
use crate::history::Identity;
use crate::interlock::{Interlock, InterlockGuard};
use crate::staging::Journal;
use crate::transaction::{Holder, Transaction, TxnId, TxnState};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Terminated transaction ids remembered for stale-handle reporting.
const RETIRED_CAPACITY: usize = 256;

/// Retry period while another process holds the interlock.
const INTERLOCK_POLL: Duration = Duration::from_millis(25);

/// How a transaction left the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    Aborted,
}

impl From<Outcome> for TxnState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Committed => TxnState::Committed,
            Outcome::Aborted => TxnState::Aborted,
        }
    }
}

enum Request {
    Transaction { id: TxnId, holder: Holder },
    Sync,
}

struct Waiter {
    ticket: u64,
    request: Request,
    grant: oneshot::Sender<()>,
}

enum HeldBy {
    Transaction(Transaction),
    Sync { since: Instant },
}

struct Held {
    ticket: u64,
    by: HeldBy,
    claim: Option<InterlockGuard>,
}

#[derive(Default)]
struct LockState {
    slot: Option<Held>,
    queue: VecDeque<Waiter>,
    retired: VecDeque<(TxnId, TxnState)>,
    next_ticket: u64,
}

impl LockState {
    fn active_txn(&self) -> Option<&Transaction> {
        match &self.slot {
            Some(Held {
                by: HeldBy::Transaction(txn),
                ..
            }) => Some(txn),
            _ => None,
        }
    }

    fn retire(&mut self, id: TxnId, state: TxnState) {
        self.retired.push_back((id, state));
        while self.retired.len() > RETIRED_CAPACITY {
            self.retired.pop_front();
        }
    }

    /// Error for a handle that no longer names the active transaction.
    fn stale(&self, id: TxnId) -> TxnError {
        match self.retired.iter().rev().find(|(rid, _)| *rid == id) {
            Some((_, TxnState::Expired)) => TxnError::ExpiredTransaction(id),
            _ => TxnError::NotActive(id),
        }
    }

    /// The active transaction if it is `id`, `Active`, and owned by `session`.
    fn owned(&mut self, id: TxnId, session: &str) -> Result<&mut Transaction> {
        if self.active_txn().is_none_or(|txn| txn.id() != id) {
            return Err(self.stale(id));
        }
        let Some(Held {
            by: HeldBy::Transaction(txn),
            ..
        }) = self.slot.as_mut()
        else {
            return Err(TxnError::NotActive(id));
        };
        if txn.holder().session != session || txn.state() != TxnState::Active {
            return Err(TxnError::NotActive(id));
        }
        Ok(txn)
    }
}

/// Journal and author handed to the committer.
#[derive(Debug)]
pub struct CommitBatch {
    pub id: TxnId,
    pub journal: Journal,
    pub author: Option<Identity>,
}

/// Snapshot of the lock as seen by one session.
#[derive(Debug, Clone, Serialize)]
pub struct TxnStatus {
    pub has_active_transaction: bool,
    pub transaction_id: Option<TxnId>,
    pub state: Option<TxnState>,
    pub is_owner: bool,
    pub staged_operations: usize,
    pub expires_in_ms: Option<u64>,
    pub sync_in_progress: bool,
    pub waiting: usize,
}

pub struct LockManager {
    state: Mutex<LockState>,
    ttl: Duration,
    interlock: Option<Interlock>,
}

impl LockManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            ttl,
            interlock: None,
        }
    }

    /// Also exclude other processes holding `interlock`.
    pub fn with_interlock(mut self, interlock: Interlock) -> Self {
        self.interlock = Some(interlock);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Wait up to `wait` for the slot and open a transaction for `holder`.
    pub async fn acquire(&self, holder: Holder, wait: Duration) -> Result<TxnId> {
        let id = TxnId::new();
        self.enqueue(Request::Transaction { id, holder }, wait).await?;
        Ok(id)
    }

    /// Wait up to `wait` for the slot on behalf of the sync scheduler.
    pub async fn acquire_sync(self: &Arc<Self>, wait: Duration) -> Result<SyncLease> {
        let ticket = self.enqueue(Request::Sync, wait).await?;
        Ok(SyncLease {
            manager: Arc::clone(self),
            ticket,
        })
    }

    async fn enqueue(&self, request: Request, wait: Duration) -> Result<u64> {
        let now = Instant::now();
        let deadline = now.checked_add(wait).unwrap_or(now + self.ttl);
        let ticket = self.wait_for_slot(request, wait).await?;
        self.claim_interlock(ticket, deadline, wait).await?;
        Ok(ticket)
    }

    async fn wait_for_slot(&self, request: Request, wait: Duration) -> Result<u64> {
        let (ticket, rx) = {
            let mut state = self.state.lock();
            self.expire_locked(&mut state, Instant::now());

            if let Request::Transaction { holder, .. } = &request {
                if state
                    .active_txn()
                    .is_some_and(|txn| txn.holder().session == holder.session)
                {
                    return Err(TxnError::AlreadyHeld(holder.session.clone()));
                }
            }

            let ticket = state.next_ticket;
            state.next_ticket += 1;

            if state.slot.is_none() && state.queue.is_empty() {
                self.grant_locked(&mut state, ticket, request);
                return Ok(ticket);
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                ticket,
                request,
                grant: tx,
            });
            tracing::debug!(
                "Lock busy, ticket {} queued at depth {}",
                ticket,
                state.queue.len()
            );
            (ticket, rx)
        };

        let mut pending = PendingGrant {
            manager: self,
            ticket,
            rx,
            settled: false,
        };
        match tokio::time::timeout(wait, &mut pending.rx).await {
            Ok(Ok(())) => {
                pending.settled = true;
                Ok(ticket)
            }
            Ok(Err(_)) => {
                pending.settled = true;
                Err(TxnError::LockTimeout(wait))
            }
            Err(_) => {
                if pending.settle() {
                    Ok(ticket)
                } else {
                    tracing::info!("Lock wait timed out after {:?} (ticket {})", wait, ticket);
                    Err(TxnError::LockTimeout(wait))
                }
            }
        }
    }

    /// Claim the cross-process lock for the slot `ticket` was just granted.
    ///
    /// The slot is given back if the claim cannot be made before `deadline`
    /// or the caller goes away while retrying.
    async fn claim_interlock(
        &self,
        ticket: u64,
        deadline: Instant,
        wait: Duration,
    ) -> Result<()> {
        let Some(interlock) = &self.interlock else {
            return Ok(());
        };
        let mut granted = GrantedSlot {
            manager: self,
            ticket,
            kept: false,
        };

        loop {
            let claim = interlock.try_claim().map_err(|e| {
                TxnError::Internal(format!(
                    "interlock {}: {}",
                    interlock.path().display(),
                    e
                ))
            })?;
            if let Some(guard) = claim {
                let mut state = self.state.lock();
                return match state.slot.as_mut() {
                    Some(held) if held.ticket == ticket => {
                        held.claim = Some(guard);
                        granted.kept = true;
                        Ok(())
                    }
                    _ => Err(TxnError::LockTimeout(wait)),
                };
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::info!(
                    "Content root locked by another process ({}), gave up after {:?}",
                    interlock.path().display(),
                    wait
                );
                return Err(TxnError::LockTimeout(wait));
            }
            tokio::time::sleep(INTERLOCK_POLL.min(deadline - now)).await;
        }
    }

    fn grant_locked(&self, state: &mut LockState, ticket: u64, request: Request) {
        let now = Instant::now();
        let by = match request {
            Request::Transaction { id, holder } => {
                tracing::info!(
                    "Transaction {} started for session {} (ttl {:?})",
                    id,
                    holder.session,
                    self.ttl
                );
                HeldBy::Transaction(Transaction::open(id, holder, now, self.ttl))
            }
            Request::Sync => {
                tracing::debug!("Sync lease granted (ticket {})", ticket);
                HeldBy::Sync { since: now }
            }
        };
        state.slot = Some(Held {
            ticket,
            by,
            claim: None,
        });
    }

    /// Pass a free slot to the oldest waiter still listening.
    fn hand_off_locked(&self, state: &mut LockState) {
        while state.slot.is_none() {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            if waiter.grant.is_closed() {
                continue;
            }
            self.grant_locked(state, waiter.ticket, waiter.request);
            if waiter.grant.send(()).is_err() {
                state.slot = None;
            }
        }
    }

    /// Drop whatever `ticket` holds and hand the slot on.
    fn release_ticket_locked(&self, state: &mut LockState, ticket: u64) {
        if state.slot.as_ref().is_none_or(|held| held.ticket != ticket) {
            return;
        }
        if let Some(held) = state.slot.take() {
            match held.by {
                HeldBy::Transaction(mut txn) => {
                    let journal = txn.finish(TxnState::Aborted);
                    journal.discard(txn.id());
                    tracing::info!("Transaction {} abandoned before use", txn.id());
                    state.retire(txn.id(), TxnState::Aborted);
                }
                HeldBy::Sync { since } => {
                    tracing::debug!("Sync lease released after {:?}", since.elapsed());
                }
            }
        }
        self.hand_off_locked(state);
    }

    /// Expire the active transaction if its deadline has passed.
    fn expire_locked(&self, state: &mut LockState, now: Instant) -> Option<TxnId> {
        if !state.active_txn().is_some_and(|txn| txn.is_overdue(now)) {
            return None;
        }
        let Some(Held {
            by: HeldBy::Transaction(mut txn),
            ..
        }) = state.slot.take()
        else {
            return None;
        };

        let id = txn.id();
        let journal = txn.finish(TxnState::Expired);
        tracing::warn!(
            "Transaction {} expired after {:?}, discarding {} staged operations",
            id,
            self.ttl,
            journal.len()
        );
        journal.discard(id);
        state.retire(id, TxnState::Expired);
        self.hand_off_locked(state);
        Some(id)
    }

    /// Expire an overdue transaction now. Called by the watchdog.
    pub fn expire_overdue(&self) -> Option<TxnId> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state, Instant::now())
    }

    /// Run `f` against transaction `id` if it is active and owned by `session`.
    pub fn with_active<R>(
        &self,
        id: TxnId,
        session: &str,
        f: impl FnOnce(&mut Transaction) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state, Instant::now());
        let txn = state.owned(id, session)?;
        f(txn)
    }

    /// `Active → Committing`; the journal moves to the committer.
    pub fn begin_commit(&self, id: TxnId, session: &str) -> Result<CommitBatch> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state, Instant::now());
        let txn = state.owned(id, session)?;
        let journal = txn.begin_commit();
        tracing::info!("Transaction {} committing {} operations", id, journal.len());
        Ok(CommitBatch {
            id,
            journal,
            author: txn.holder().author.clone(),
        })
    }

    /// Terminate the active transaction `id` and hand the slot on.
    ///
    /// A release for a transaction that no longer holds the slot is ignored.
    pub fn release(&self, id: TxnId, outcome: Outcome) {
        let mut state = self.state.lock();
        if state.active_txn().is_none_or(|txn| txn.id() != id) {
            tracing::warn!("Ignoring release of {}: not the lock holder", id);
            return;
        }
        if let Some(Held {
            by: HeldBy::Transaction(mut txn),
            ..
        }) = state.slot.take()
        {
            let journal = txn.finish(outcome.into());
            journal.discard(id);
            tracing::info!(
                "Transaction {} released ({:?}) after {:?}",
                id,
                outcome,
                txn.opened_at().elapsed()
            );
            state.retire(id, txn.state());
        }
        self.hand_off_locked(&mut state);
    }

    /// Abort an `Active` transaction owned by `session`, discarding its journal.
    pub fn abort(&self, id: TxnId, session: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            self.expire_locked(&mut state, Instant::now());
            state.owned(id, session)?;
        }
        self.release(id, Outcome::Aborted);
        Ok(())
    }

    pub fn status(&self, session: &str) -> TxnStatus {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.expire_locked(&mut state, now);

        let txn = state.active_txn();
        TxnStatus {
            has_active_transaction: txn.is_some(),
            transaction_id: txn.map(|t| t.id()),
            state: txn.map(|t| t.state()),
            is_owner: txn.is_some_and(|t| t.holder().session == session),
            staged_operations: txn.map(|t| t.journal().len()).unwrap_or(0),
            expires_in_ms: txn
                .map(|t| t.deadline().saturating_duration_since(now).as_millis() as u64),
            sync_in_progress: matches!(
                state.slot,
                Some(Held {
                    by: HeldBy::Sync { .. },
                    ..
                })
            ),
            waiting: state.queue.len(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().slot.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Start the deadline watchdog, stopping when `shutdown` flips to `true`.
    pub fn spawn_watchdog(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let signal = tokio::select! {
                    _ = ticker.tick() => None,
                    changed = shutdown.changed() => Some(changed.is_ok()),
                };
                match signal {
                    None => {
                        manager.expire_overdue();
                    }
                    Some(true) if !*shutdown.borrow() => {}
                    Some(_) => break,
                }
            }
            tracing::debug!("Lock watchdog stopped");
        })
    }
}

/// A queued acquisition. Dropping it before the outcome is observed removes
/// the waiter, or releases a grant that raced in.
struct PendingGrant<'a> {
    manager: &'a LockManager,
    ticket: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl PendingGrant<'_> {
    /// Resolve a timed-out wait. Returns `true` if the grant arrived anyway.
    fn settle(&mut self) -> bool {
        self.settled = true;
        let mut state = self.manager.state.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.ticket == self.ticket) {
            state.queue.remove(pos);
            return false;
        }
        self.rx.try_recv().is_ok()
    }
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.manager.state.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.ticket == self.ticket) {
            state.queue.remove(pos);
            return;
        }
        if self.rx.try_recv().is_ok() {
            self.manager.release_ticket_locked(&mut state, self.ticket);
        }
    }
}

/// A slot granted in-process whose interlock claim has not completed yet.
struct GrantedSlot<'a> {
    manager: &'a LockManager,
    ticket: u64,
    kept: bool,
}

impl Drop for GrantedSlot<'_> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        let mut state = self.manager.state.lock();
        self.manager.release_ticket_locked(&mut state, self.ticket);
    }
}

/// The sync scheduler's hold on the slot; released on drop.
pub struct SyncLease {
    manager: Arc<LockManager>,
    ticket: u64,
}

impl Drop for SyncLease {
    fn drop(&mut self) {
        let mut state = self.manager.state.lock();
        self.manager.release_ticket_locked(&mut state, self.ticket);
    }
}
