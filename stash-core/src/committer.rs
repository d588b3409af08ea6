//! Commits a transaction's journal to the live tree and the history together.

use crate::error::{Result, TxnError};
use crate::events::EventBus;
use crate::history::{CommitId, HistoryBackend, Identity};
use crate::lock::{CommitBatch, LockManager, Outcome};
use crate::staging::{Journal, StagingLayer};
use crate::transaction::TxnId;
use std::sync::Arc;

/// Remote the branch is pushed to after each commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub remote: String,
    pub branch: String,
}

#[derive(Clone)]
pub struct HistoryCommitter {
    lock: Arc<LockManager>,
    staging: Arc<StagingLayer>,
    history: Arc<dyn HistoryBackend>,
    default_author: Identity,
    push: Option<PushTarget>,
    events: EventBus,
}

/// Releases the slot when the commit task ends, however it ends.
struct ReleaseGuard {
    lock: Arc<LockManager>,
    id: TxnId,
    outcome: Outcome,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.lock.release(self.id, self.outcome);
    }
}

impl HistoryCommitter {
    pub fn new(
        lock: Arc<LockManager>,
        staging: Arc<StagingLayer>,
        history: Arc<dyn HistoryBackend>,
        default_author: Identity,
    ) -> Self {
        Self {
            lock,
            staging,
            history,
            default_author,
            push: None,
            events: EventBus::default(),
        }
    }

    pub fn with_push(mut self, target: PushTarget) -> Self {
        self.push = Some(target);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Apply and record transaction `id`.
    ///
    /// The work runs in its own task, so the lock is released even if the
    /// caller stops waiting.
    pub async fn commit(&self, session: &str, id: TxnId, message: &str) -> Result<CommitId> {
        let batch = self.lock.begin_commit(id, session)?;
        let guard = ReleaseGuard {
            lock: Arc::clone(&self.lock),
            id,
            outcome: Outcome::Aborted,
        };

        let committer = self.clone();
        let message = message.to_string();
        tokio::spawn(async move { committer.run(batch, message, guard).await })
            .await
            .unwrap_or_else(|e| {
                Err(TxnError::Internal(format!(
                    "commit task for {} failed: {}",
                    id, e
                )))
            })
    }

    async fn run(
        &self,
        batch: CommitBatch,
        message: String,
        mut guard: ReleaseGuard,
    ) -> Result<CommitId> {
        let CommitBatch { id, journal, author } = batch;

        let applied = self.staging.apply(&journal).await?;
        let changed = applied.changed_paths();
        let author = author.unwrap_or_else(|| self.default_author.clone());
        let message = compose_message(&message, &journal);

        let commit_id = match self.history.record(&changed, &author, &message).await {
            Ok(commit_id) => commit_id,
            Err(e) => {
                tracing::warn!("Recording {} failed, reverting: {}", id, e);
                if !self.staging.revert(&applied).await {
                    tracing::error!("Revert after failed record of {} was incomplete", id);
                }
                return Err(TxnError::Commit(e));
            }
        };
        guard.outcome = Outcome::Committed;
        tracing::info!(
            "Transaction {} committed as {} ({} paths changed)",
            id,
            commit_id.short(),
            changed.len()
        );

        if let Some(target) = &self.push {
            if let Err(e) = self.history.push(&target.remote, &target.branch).await {
                tracing::warn!(
                    "Push to {}/{} failed after commit {}: {}",
                    target.remote,
                    target.branch,
                    commit_id.short(),
                    e
                );
            }
        }

        self.events.publish_commit(&commit_id, &applied);
        Ok(commit_id)
    }

    /// Abandon an `Active` transaction without touching the tree or history.
    pub fn abort(&self, session: &str, id: TxnId) -> Result<()> {
        self.lock.abort(id, session)?;
        tracing::info!("Transaction {} aborted by session {}", id, session);
        Ok(())
    }
}

/// The caller's message, followed by the staged operations.
fn compose_message(message: &str, journal: &Journal) -> String {
    let subject = message.trim();
    if journal.is_empty() {
        return subject.to_string();
    }
    format!("{}\n\n{}", subject, journal.summary())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operation;
    use std::collections::HashMap;

    #[test]
    fn test_compose_message() {
        let mut journal = Journal::new();
        assert_eq!(compose_message("  subject  ", &journal), "subject");

        journal
            .push(Operation::create("a.md", "x"), &HashMap::new())
            .unwrap();
        assert_eq!(compose_message("Add a", &journal), "Add a\n\ncreate a.md");
    }
}
