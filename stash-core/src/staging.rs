//! Per-transaction staging.
//!
//! Staged operations live only in the transaction's [`Journal`]; the live
//! tree is untouched until [`StagingLayer::apply`] runs at commit time.

use crate::content::{ContentError, ContentStore, normalize_path, read_optional};
use crate::error::{Result, TxnError};
use crate::lock::LockManager;
use crate::transaction::{OpKind, Operation, TxnId};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered operations staged by one transaction, plus the staged view: the
/// presence of every path an operation has decided so far.
#[derive(Debug, Default)]
pub struct Journal {
    ops: Vec<Operation>,
    view: HashMap<String, bool>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Presence of `path` as decided by earlier operations, `None` when the
    /// live tree decides.
    pub fn staged_presence(&self, path: &str) -> Option<bool> {
        self.view.get(path).copied()
    }

    /// Paths touched by `op` that must be looked up in the live tree.
    pub fn unresolved(&self, op: &Operation) -> Vec<String> {
        op.touched_paths()
            .filter(|p| !self.view.contains_key(*p))
            .map(str::to_string)
            .collect()
    }

    /// Validate `op` against the staged view and append it.
    ///
    /// `live` holds live-tree presence for the paths the view does not
    /// decide; a path found in neither is treated as absent.
    pub fn push(&mut self, op: Operation, live: &HashMap<String, bool>) -> Result<()> {
        let present = |path: &str| {
            self.view
                .get(path)
                .or_else(|| live.get(path))
                .copied()
                .unwrap_or(false)
        };

        match op.kind {
            OpKind::Create | OpKind::Update if op.payload.is_none() => {
                return Err(TxnError::MalformedOperation(format!("{} without content", op)));
            }
            OpKind::Create => {
                if present(&op.path) {
                    return Err(TxnError::AlreadyExists(op.path));
                }
            }
            OpKind::Update | OpKind::Delete => {
                if !present(&op.path) {
                    return Err(TxnError::NotFound(op.path));
                }
            }
            OpKind::Move => {
                let Some(dest) = op.dest_path.as_deref() else {
                    return Err(TxnError::MalformedOperation(format!(
                        "move of {} without destination",
                        op.path
                    )));
                };
                if !present(&op.path) {
                    return Err(TxnError::NotFound(op.path));
                }
                if present(dest) {
                    return Err(TxnError::AlreadyExists(dest.to_string()));
                }
            }
        }

        match op.kind {
            OpKind::Create | OpKind::Update => {
                self.view.insert(op.path.clone(), true);
            }
            OpKind::Delete => {
                self.view.insert(op.path.clone(), false);
            }
            OpKind::Move => {
                self.view.insert(op.path.clone(), false);
                if let Some(dest) = &op.dest_path {
                    self.view.insert(dest.clone(), true);
                }
            }
        }
        self.ops.push(op);
        Ok(())
    }

    /// Drop every staged operation without touching the live tree.
    pub fn discard(self, id: TxnId) {
        if !self.ops.is_empty() {
            tracing::debug!("Discarded {} staged operations of {}", self.ops.len(), id);
        }
    }

    /// One line per operation, for the history message body.
    pub fn summary(&self) -> String {
        self.ops
            .iter()
            .map(|op| op.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content of one path around an apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub path: String,
    /// Content before the first mutation, `None` if absent
    pub before: Option<Bytes>,
    /// Content after the last successful mutation, `None` if absent
    pub after: Option<Bytes>,
}

impl PathChange {
    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

/// Paths touched by an apply, in first-touch order.
#[derive(Debug, Clone, Default)]
pub struct AppliedSet {
    changes: Vec<PathChange>,
}

impl AppliedSet {
    pub fn changes(&self) -> &[PathChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Paths whose content actually changed, sorted.
    pub fn changed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .changes
            .iter()
            .filter(|c| !c.is_noop())
            .map(|c| c.path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    fn find(&self, path: &str) -> Option<&PathChange> {
        self.changes.iter().find(|c| c.path == path)
    }

    fn touches(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    fn snapshot(&mut self, path: &str, before: Option<Bytes>) {
        self.changes.push(PathChange {
            path: path.to_string(),
            after: before.clone(),
            before,
        });
    }

    fn current(&self, path: &str) -> Option<Bytes> {
        self.find(path).and_then(|c| c.after.clone())
    }

    fn set_after(&mut self, path: &str, after: Option<Bytes>) {
        if let Some(change) = self.changes.iter_mut().find(|c| c.path == path) {
            change.after = after;
        }
    }
}

pub struct StagingLayer {
    store: Arc<dyn ContentStore>,
}

impl StagingLayer {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Stage `op` into transaction `id`.
    ///
    /// Live-tree lookups happen outside the lock; the journal is re-checked
    /// when the operation is appended.
    pub async fn stage(
        &self,
        lock: &LockManager,
        session: &str,
        id: TxnId,
        mut op: Operation,
    ) -> Result<()> {
        op.path = normalize_path(&op.path)?;
        if let Some(dest) = op.dest_path.take() {
            op.dest_path = Some(normalize_path(&dest)?);
        }

        let unresolved = lock.with_active(id, session, |txn| Ok(txn.journal().unresolved(&op)))?;

        let mut live = HashMap::with_capacity(unresolved.len());
        for path in unresolved {
            let present = self.store.exists(&path).await?;
            live.insert(path, present);
        }

        let described = op.to_string();
        lock.with_active(id, session, |txn| txn.journal_mut().push(op, &live))?;
        tracing::debug!("Staged {} in {}", described, id);
        Ok(())
    }

    /// Execute `journal` against the live tree.
    ///
    /// On a physical failure every path touched so far is restored and
    /// `TxnError::Apply` is returned.
    pub async fn apply(&self, journal: &Journal) -> Result<AppliedSet> {
        let mut applied = AppliedSet::default();

        for op in journal.ops() {
            if let Err((path, source)) = self.apply_one(op, &mut applied).await {
                tracing::warn!("Apply of '{}' failed at {}: {}", op, path, source);
                if !self.revert(&applied).await {
                    tracing::error!("Live tree may be inconsistent after failed apply");
                }
                return Err(TxnError::Apply { path, source });
            }
        }

        tracing::debug!(
            "Applied {} operations touching {} paths",
            journal.len(),
            applied.changes.len()
        );
        Ok(applied)
    }

    async fn apply_one(
        &self,
        op: &Operation,
        applied: &mut AppliedSet,
    ) -> std::result::Result<(), (String, ContentError)> {
        for path in op.touched_paths() {
            if !applied.touches(path) {
                let before = read_optional(self.store.as_ref(), path)
                    .await
                    .map_err(|e| (path.to_string(), e))?;
                applied.snapshot(path, before);
            }
        }

        let failed = |e| (op.path.clone(), e);
        match op.kind {
            OpKind::Create | OpKind::Update => {
                let data = op.payload.clone().unwrap_or_default();
                self.store
                    .write(&op.path, data.clone())
                    .await
                    .map_err(failed)?;
                applied.set_after(&op.path, Some(data));
            }
            OpKind::Delete => {
                self.store.delete(&op.path).await.map_err(failed)?;
                applied.set_after(&op.path, None);
            }
            OpKind::Move => {
                let dest = op.dest_path.as_deref().unwrap_or_default();
                let moved = applied.current(&op.path);
                self.store.rename(&op.path, dest).await.map_err(failed)?;
                applied.set_after(&op.path, None);
                applied.set_after(dest, moved);
            }
        }
        Ok(())
    }

    /// Restore every path in `applied` to its pre-apply content, last touched
    /// first. Returns `false` if any path could not be restored.
    pub async fn revert(&self, applied: &AppliedSet) -> bool {
        let mut clean = true;

        for change in applied.changes.iter().rev() {
            if change.is_noop() {
                continue;
            }
            let restored = match &change.before {
                Some(data) => self.store.write(&change.path, data.clone()).await,
                None => match self.store.delete(&change.path).await {
                    Err(ContentError::NotFound(_)) => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = restored {
                tracing::error!("Failed to restore {}: {}", change.path, e);
                clean = false;
            }
        }

        if clean {
            tracing::debug!("Reverted {} paths", applied.changes.len());
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::LocalContentStore;
    use tempfile::TempDir;

    fn live(entries: &[(&str, bool)]) -> HashMap<String, bool> {
        entries
            .iter()
            .map(|(p, present)| (p.to_string(), *present))
            .collect()
    }

    #[test]
    fn test_create_then_update_in_staged_view() {
        let mut journal = Journal::new();
        journal
            .push(Operation::create("a.md", "x"), &live(&[("a.md", false)]))
            .unwrap();
        // the live tree still says absent, the staged view wins
        journal
            .push(Operation::update("a.md", "y"), &live(&[("a.md", false)]))
            .unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.staged_presence("a.md"), Some(true));
        assert!(journal.unresolved(&Operation::delete("a.md")).is_empty());
    }

    #[test]
    fn test_create_existing_path_rejected() {
        let mut journal = Journal::new();
        let err = journal
            .push(Operation::create("a.md", "x"), &live(&[("a.md", true)]))
            .unwrap_err();
        assert!(matches!(err, TxnError::AlreadyExists(p) if p == "a.md"));
        assert!(journal.is_empty());

        journal
            .push(Operation::create("b.md", "x"), &live(&[]))
            .unwrap();
        let err = journal
            .push(Operation::create("b.md", "again"), &live(&[]))
            .unwrap_err();
        assert!(matches!(err, TxnError::AlreadyExists(_)));
    }

    #[test]
    fn test_operations_missing_fields_rejected() {
        let mut journal = Journal::new();
        let without_content = Operation {
            payload: None,
            ..Operation::update("a.md", "")
        };
        let err = journal
            .push(without_content, &live(&[("a.md", true)]))
            .unwrap_err();
        assert!(matches!(err, TxnError::MalformedOperation(_)));

        let create = Operation {
            payload: None,
            ..Operation::create("b.md", "")
        };
        assert!(matches!(
            journal.push(create, &live(&[])),
            Err(TxnError::MalformedOperation(_))
        ));

        let nowhere = Operation {
            dest_path: None,
            ..Operation::rename("a.md", "c.md")
        };
        assert!(matches!(
            journal.push(nowhere, &live(&[("a.md", true)])),
            Err(TxnError::MalformedOperation(_))
        ));
        assert!(journal.is_empty());
        assert_eq!(journal.staged_presence("b.md"), None);
    }

    #[test]
    fn test_update_and_delete_require_presence() {
        let mut journal = Journal::new();
        assert!(matches!(
            journal.push(Operation::update("a.md", "y"), &live(&[("a.md", false)])),
            Err(TxnError::NotFound(_))
        ));
        assert!(matches!(
            journal.push(Operation::delete("a.md"), &live(&[("a.md", false)])),
            Err(TxnError::NotFound(_))
        ));

        journal
            .push(Operation::delete("b.md"), &live(&[("b.md", true)]))
            .unwrap();
        // deleted in this transaction, so a second delete fails
        assert!(matches!(
            journal.push(Operation::delete("b.md"), &live(&[("b.md", true)])),
            Err(TxnError::NotFound(_))
        ));
        // and it can be created again
        journal
            .push(Operation::create("b.md", "new"), &live(&[]))
            .unwrap();
    }

    #[test]
    fn test_move_preconditions() {
        let mut journal = Journal::new();
        assert!(matches!(
            journal.push(
                Operation::rename("a.md", "b.md"),
                &live(&[("a.md", false), ("b.md", false)])
            ),
            Err(TxnError::NotFound(p)) if p == "a.md"
        ));
        assert!(matches!(
            journal.push(
                Operation::rename("a.md", "b.md"),
                &live(&[("a.md", true), ("b.md", true)])
            ),
            Err(TxnError::AlreadyExists(p)) if p == "b.md"
        ));

        journal
            .push(
                Operation::rename("a.md", "b.md"),
                &live(&[("a.md", true), ("b.md", false)]),
            )
            .unwrap();
        assert_eq!(journal.staged_presence("a.md"), Some(false));
        assert_eq!(journal.staged_presence("b.md"), Some(true));
    }

    #[tokio::test]
    async fn test_apply_tracks_before_and_after() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalContentStore::open(tmp.path()).unwrap());
        store.write("old.md", Bytes::from_static(b"old")).await.unwrap();
        let staging = StagingLayer::new(store.clone());

        let mut journal = Journal::new();
        journal
            .push(Operation::create("a.md", "x"), &live(&[]))
            .unwrap();
        journal
            .push(Operation::update("a.md", "y"), &live(&[]))
            .unwrap();
        journal
            .push(Operation::rename("old.md", "new.md"), &live(&[("old.md", true)]))
            .unwrap();

        let applied = staging.apply(&journal).await.unwrap();
        assert_eq!(store.read("a.md").await.unwrap(), "y");
        assert_eq!(store.read("new.md").await.unwrap(), "old");
        assert!(!store.exists("old.md").await.unwrap());
        assert_eq!(applied.changed_paths(), vec!["a.md", "new.md", "old.md"]);

        assert!(staging.revert(&applied).await);
        assert!(!store.exists("a.md").await.unwrap());
        assert!(!store.exists("new.md").await.unwrap());
        assert_eq!(store.read("old.md").await.unwrap(), "old");
    }

    #[tokio::test]
    async fn test_create_then_delete_is_not_a_change() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalContentStore::open(tmp.path()).unwrap());
        let staging = StagingLayer::new(store.clone());

        let mut journal = Journal::new();
        journal
            .push(Operation::create("tmp.md", "x"), &live(&[]))
            .unwrap();
        journal
            .push(Operation::delete("tmp.md"), &live(&[]))
            .unwrap();

        let applied = staging.apply(&journal).await.unwrap();
        assert!(applied.changed_paths().is_empty());
        assert!(!store.exists("tmp.md").await.unwrap());
    }

    #[test]
    fn test_summary_lists_operations() {
        let mut journal = Journal::new();
        journal
            .push(Operation::create("a.md", "x"), &live(&[]))
            .unwrap();
        journal
            .push(Operation::rename("a.md", "b.md"), &live(&[]))
            .unwrap();
        assert_eq!(journal.summary(), "create a.md\nmove a.md -> b.md");
    }
}
