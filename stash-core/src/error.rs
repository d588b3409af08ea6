//! Error taxonomy surfaced by the write gate.

use crate::content::ContentError;
use crate::history::HistoryError;
use crate::transaction::TxnId;
use std::time::Duration;

/// Result type for gated operations
pub type Result<T> = std::result::Result<T, TxnError>;

/// Errors returned to callers of the write gate.
///
/// None of these are fatal: every variant leaves the lock released (or still
/// held by a live caller) and the content tree consistent.
#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    /// The wait queue bound elapsed before the slot was granted.
    #[error("Transaction lock unavailable after {0:?}, try again later")]
    LockTimeout(Duration),

    /// The session already owns the active transaction.
    #[error("A transaction is already active for session {0}")]
    AlreadyHeld(String),

    #[error("No active transaction {0} for this session")]
    NotActive(TxnId),

    #[error("Transaction {0} expired before it was resolved")]
    ExpiredTransaction(TxnId),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    /// An operation missing the fields its kind requires.
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    /// A physical write failed mid-apply; the tree has been reverted.
    #[error("Apply failed at {path}: {source}")]
    Apply {
        path: String,
        #[source]
        source: ContentError,
    },

    /// Recording the history entry failed after apply; the tree has been reverted.
    #[error("History commit failed: {0}")]
    Commit(#[source] HistoryError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxnError {
    /// Whether the caller should simply retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxnError::LockTimeout(_))
    }

    /// Whether the transaction handle is dead and a new one must be acquired.
    pub fn is_stale_handle(&self) -> bool {
        matches!(
            self,
            TxnError::NotActive(_) | TxnError::ExpiredTransaction(_)
        )
    }
}
