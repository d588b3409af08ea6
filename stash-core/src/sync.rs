//! Periodic pull of remote history, serialized with transactions through the
//! shared write lock.
//!
//! A tick that cannot get the lock within its short wait is skipped; sync
//! never pre-empts a transaction. Shutdown is only observed between ticks,
//! so an in-flight pull always runs to completion.

use crate::config::SyncConfig;
use crate::events::EventBus;
use crate::history::{HistoryBackend, PullResult};
use crate::lock::LockManager;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Counters exposed to operators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub ticks: u64,
    pub pulls: u64,
    pub skipped: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    /// Unix timestamp of the last successful pull
    pub last_success: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The lock was busy
    Skipped,
    Pulled(PullResult),
    Failed(String),
}

#[derive(Clone)]
pub struct SyncScheduler {
    lock: Arc<LockManager>,
    history: Arc<dyn HistoryBackend>,
    config: SyncConfig,
    events: EventBus,
    stats: Arc<Mutex<SyncStats>>,
}

impl SyncScheduler {
    pub fn new(
        lock: Arc<LockManager>,
        history: Arc<dyn HistoryBackend>,
        config: SyncConfig,
        events: EventBus,
    ) -> Self {
        Self {
            lock,
            history,
            config,
            events,
            stats: Arc::new(Mutex::new(SyncStats::default())),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Run one sync attempt.
    pub async fn tick(&self) -> TickOutcome {
        self.stats.lock().ticks += 1;

        let lease = match self.lock.acquire_sync(self.config.lock_wait()).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::debug!("Sync tick skipped: {}", e);
                self.stats.lock().skipped += 1;
                return TickOutcome::Skipped;
            }
        };

        let pulled = self
            .history
            .pull(&self.config.remote, &self.config.branch, self.config.recursive)
            .await;
        drop(lease);

        match pulled {
            Ok(result) => {
                {
                    let mut stats = self.stats.lock();
                    stats.pulls += 1;
                    stats.last_success = Some(chrono::Utc::now().timestamp());
                }
                if result.is_up_to_date() {
                    tracing::debug!("Sync: already up to date");
                } else {
                    tracing::info!(
                        "Sync pulled {}/{}: {} added, {} modified, {} deleted",
                        self.config.remote,
                        self.config.branch,
                        result.added.len(),
                        result.modified.len(),
                        result.deleted.len()
                    );
                    self.events.publish_pull(&result);
                }
                TickOutcome::Pulled(result)
            }
            Err(e) => {
                tracing::warn!(
                    "Sync pull from {}/{} failed: {}",
                    self.config.remote,
                    self.config.branch,
                    e
                );
                let message = e.to_string();
                let mut stats = self.stats.lock();
                stats.failures += 1;
                stats.last_error = Some(message.clone());
                TickOutcome::Failed(message)
            }
        }
    }

    /// Tick every `interval` until `shutdown` flips to `true`. The first tick
    /// fires one interval after the call.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let period = scheduler.config.interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                "Sync scheduler started: {}/{} every {:?}",
                scheduler.config.remote,
                scheduler.config.branch,
                period
            );

            loop {
                let signal = tokio::select! {
                    _ = ticker.tick() => None,
                    changed = shutdown.changed() => Some(changed.is_ok()),
                };
                match signal {
                    None => {
                        if *shutdown.borrow() {
                            break;
                        }
                        scheduler.tick().await;
                    }
                    Some(true) if !*shutdown.borrow() => {}
                    Some(_) => break,
                }
            }
            tracing::info!("Sync scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use crate::transaction::Holder;
    use std::time::Duration;

    fn scheduler(history: Arc<MemoryHistory>, lock: Arc<LockManager>) -> SyncScheduler {
        let config = SyncConfig {
            enabled: true,
            interval_secs: 10,
            lock_wait_ms: 50,
            ..Default::default()
        };
        SyncScheduler::new(lock, history, config, EventBus::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skips_while_transaction_active() {
        let history = Arc::new(MemoryHistory::new());
        let lock = Arc::new(LockManager::new(Duration::from_secs(60)));
        let sync = scheduler(history.clone(), lock.clone());

        let id = lock
            .acquire(Holder::new("writer"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sync.tick().await, TickOutcome::Skipped);
        assert_eq!(history.pull_count(), 0);
        assert_eq!(sync.stats().skipped, 1);
        assert_eq!(lock.status("writer").transaction_id, Some(id));

        lock.release(id, crate::lock::Outcome::Committed);
        assert!(matches!(sync.tick().await, TickOutcome::Pulled(_)));
        assert_eq!(history.pull_count(), 1);
        assert!(!lock.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pull_is_recorded() {
        let history = Arc::new(MemoryHistory::new());
        let lock = Arc::new(LockManager::new(Duration::from_secs(60)));
        let sync = scheduler(history.clone(), lock.clone());

        history.fail_next_pulls(1);
        assert!(matches!(sync.tick().await, TickOutcome::Failed(_)));

        let stats = sync.stats();
        assert_eq!(stats.failures, 1);
        assert!(stats.last_error.unwrap().contains("injected"));
        assert!(stats.last_success.is_none());
        assert!(!lock.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_publishes_events() {
        let history = Arc::new(MemoryHistory::new());
        let lock = Arc::new(LockManager::new(Duration::from_secs(60)));
        let sync = scheduler(history.clone(), lock);
        let mut events = sync.events.subscribe();

        history
            .queue_pull(PullResult {
                modified: vec!["shared.md".to_string()],
                ..Default::default()
            })
            .await;
        sync.tick().await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.path, "shared.md");
        assert_eq!(event.kind, crate::events::ChangeKind::Updated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_ticks_and_stops() {
        let history = Arc::new(MemoryHistory::new());
        let lock = Arc::new(LockManager::new(Duration::from_secs(60)));
        let sync = scheduler(history.clone(), lock);

        let (tx, rx) = watch::channel(false);
        let handle = sync.spawn(rx);

        // first tick one interval in
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(history.pull_count(), 0);
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(history.pull_count(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(sync.stats().ticks, 2);
    }
}
