//! Transaction records and staged operations.

use crate::history::Identity;
use crate::staging::Journal;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque transaction handle, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(Uuid);

impl TxnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxnId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle: `Active → Committing → {Committed | Aborted}`, or
/// `Active → {Aborted | Expired}`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborted,
    Expired,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::Aborted | TxnState::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    Delete,
    Move,
}

/// A single staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub path: String,
    /// Destination of a `Move`
    pub dest_path: Option<String>,
    /// Full replacement content for `Create`/`Update`
    pub payload: Option<Bytes>,
}

impl Operation {
    pub fn create(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            kind: OpKind::Create,
            path: path.into(),
            dest_path: None,
            payload: Some(content.into()),
        }
    }

    pub fn update(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            kind: OpKind::Update,
            path: path.into(),
            dest_path: None,
            payload: Some(content.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            path: path.into(),
            dest_path: None,
            payload: None,
        }
    }

    pub fn rename(path: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Move,
            path: path.into(),
            dest_path: Some(dest.into()),
            payload: None,
        }
    }

    /// Every path this operation reads or mutates.
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.path.as_str()).chain(self.dest_path.as_deref())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.dest_path) {
            (OpKind::Create, _) => write!(f, "create {}", self.path),
            (OpKind::Update, _) => write!(f, "update {}", self.path),
            (OpKind::Delete, _) => write!(f, "delete {}", self.path),
            (OpKind::Move, Some(dest)) => write!(f, "move {} -> {}", self.path, dest),
            (OpKind::Move, None) => write!(f, "move {}", self.path),
        }
    }
}

/// Who owns a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    /// Caller session the transaction is bound to
    pub session: String,
    /// Identity recorded as the history author
    pub author: Option<Identity>,
}

impl Holder {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            author: None,
        }
    }

    pub fn with_author(mut self, author: Identity) -> Self {
        self.author = Some(author);
        self
    }
}

/// The transaction occupying the lock slot.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    state: TxnState,
    journal: Journal,
    opened_at: Instant,
    deadline: Instant,
    holder: Holder,
}

impl Transaction {
    pub(crate) fn open(id: TxnId, holder: Holder, now: Instant, ttl: Duration) -> Self {
        Self {
            id,
            state: TxnState::Active,
            journal: Journal::new(),
            opened_at: now,
            deadline: now + ttl,
            holder,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn holder(&self) -> &Holder {
        &self.holder
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub(crate) fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.state == TxnState::Active && now >= self.deadline
    }

    /// `Active → Committing`, handing the journal to the committer.
    pub(crate) fn begin_commit(&mut self) -> Journal {
        debug_assert_eq!(self.state, TxnState::Active);
        self.state = TxnState::Committing;
        std::mem::take(&mut self.journal)
    }

    /// Move to a terminal state, returning whatever journal is left.
    pub(crate) fn finish(&mut self, state: TxnState) -> Journal {
        debug_assert!(state.is_terminal());
        debug_assert!(!self.state.is_terminal());
        self.state = state;
        std::mem::take(&mut self.journal)
    }
}
