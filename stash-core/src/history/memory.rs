//! In-process history log.
//!
//! Entries are content addressed (SHA-256 over the bincode encoding, parent
//! included) and kept in memory. Used when embedding the gate without a git
//! checkout and for exercising failure paths: records and pulls can be made
//! to fail on demand, and pull results can be queued.

use super::{CommitId, HistoryBackend, HistoryError, Identity, LogEntry, PullResult, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

/// A single recorded entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub parent: Option<CommitId>,
    pub paths: Vec<String>,
    pub author: Identity,
    pub message: String,
    pub timestamp: i64,
}

impl HistoryRecord {
    /// Compute the entry ID
    pub fn id(&self) -> CommitId {
        let encoded = bincode::serialize(self).unwrap_or_default();
        CommitId::new(hex::encode(Sha256::digest(&encoded)))
    }
}

#[derive(Default)]
pub struct MemoryHistory {
    records: Arc<RwLock<Vec<(CommitId, HistoryRecord)>>>,
    queued_pulls: Mutex<VecDeque<PullResult>>,
    pushes: Mutex<Vec<(String, String)>>,
    failing_records: AtomicU32,
    failing_pulls: AtomicU32,
    failing_pushes: AtomicU32,
    pull_count: AtomicU64,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, oldest first.
    pub async fn records(&self) -> Vec<(CommitId, HistoryRecord)> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn head(&self) -> Option<CommitId> {
        self.records.read().await.last().map(|(id, _)| id.clone())
    }

    /// Make the next `n` calls to `record` fail.
    pub fn fail_next_records(&self, n: u32) {
        self.failing_records.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `pull` fail.
    pub fn fail_next_pulls(&self, n: u32) {
        self.failing_pulls.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_pushes(&self, n: u32) {
        self.failing_pushes.store(n, Ordering::SeqCst);
    }

    /// Result returned by the next successful pull.
    pub async fn queue_pull(&self, result: PullResult) {
        self.queued_pulls.lock().await.push_back(result);
    }

    /// Number of pulls attempted, failed ones included.
    pub fn pull_count(&self) -> u64 {
        self.pull_count.load(Ordering::SeqCst)
    }

    pub async fn pushes(&self) -> Vec<(String, String)> {
        self.pushes.lock().await.clone()
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl HistoryBackend for MemoryHistory {
    async fn record(
        &self,
        changed_paths: &[String],
        author: &Identity,
        message: &str,
    ) -> Result<CommitId> {
        if take_failure(&self.failing_records) {
            return Err(HistoryError::Rejected("injected record failure".to_string()));
        }

        let mut records = self.records.write().await;
        let record = HistoryRecord {
            parent: records.last().map(|(id, _)| id.clone()),
            paths: changed_paths.to_vec(),
            author: author.clone(),
            message: message.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let id = record.id();
        records.push((id.clone(), record));

        tracing::debug!("Recorded {} ({} paths)", id.short(), changed_paths.len());
        Ok(id)
    }

    async fn pull(&self, remote: &str, branch: &str, _recursive: bool) -> Result<PullResult> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_pulls) {
            return Err(HistoryError::Command {
                command: format!("pull {} {}", remote, branch),
                stderr: "injected pull failure".to_string(),
            });
        }
        Ok(self
            .queued_pulls
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| PullResult {
                message: "Already up to date.".to_string(),
                ..Default::default()
            }))
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        if take_failure(&self.failing_pushes) {
            return Err(HistoryError::Command {
                command: format!("push {} {}", remote, branch),
                stderr: "injected push failure".to_string(),
            });
        }
        self.pushes
            .lock()
            .await
            .push((remote.to_string(), branch.to_string()));
        Ok(())
    }

    async fn log(&self, path: Option<&str>, max_count: usize) -> Result<Vec<LogEntry>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .filter(|(_, record)| path.is_none_or(|p| record.paths.iter().any(|rp| rp == p)))
            .take(max_count)
            .map(|(id, record)| LogEntry {
                commit_id: id.clone(),
                author: record.author.name.clone(),
                timestamp: record.timestamp,
                message: record.message.lines().next().unwrap_or_default().to_string(),
            })
            .collect())
    }
}
