//! Change notifications for paths mutated by commits and pulls.

use crate::history::{CommitId, PullResult};
use crate::staging::AppliedSet;
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    Commit(CommitId),
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    pub origin: ChangeOrigin,
}

/// Fan-out of [`ChangeEvent`]s. Slow subscribers lag rather than block
/// publishers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    /// Publish one event per changed path of a committed apply.
    pub fn publish_commit(&self, commit: &CommitId, applied: &AppliedSet) {
        for change in applied.changes().iter().filter(|c| !c.is_noop()) {
            let kind = match (&change.before, &change.after) {
                (None, _) => ChangeKind::Created,
                (Some(_), None) => ChangeKind::Deleted,
                (Some(_), Some(_)) => ChangeKind::Updated,
            };
            self.publish(ChangeEvent {
                kind,
                path: change.path.clone(),
                origin: ChangeOrigin::Commit(commit.clone()),
            });
        }
    }

    /// Publish one event per path a pull brought in.
    pub fn publish_pull(&self, pulled: &PullResult) {
        let kinds = [
            (ChangeKind::Created, &pulled.added),
            (ChangeKind::Updated, &pulled.modified),
            (ChangeKind::Deleted, &pulled.deleted),
        ];
        for (kind, paths) in kinds {
            for path in paths {
                self.publish(ChangeEvent {
                    kind,
                    path: path.clone(),
                    origin: ChangeOrigin::Pull,
                });
            }
        }
    }
}
