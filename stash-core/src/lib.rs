//! Stash Core Library
//!
//! Transactional write gating for a shared, git-backed content tree:
//! - Lock manager with a FIFO wait queue and a deadline watchdog
//! - Staging layer recording per-transaction operation journals
//! - History committer applying a journal and recording it atomically
//! - Sync scheduler pulling remote history under the same lock
//! - Filesystem and history collaborators (local tree, git CLI, in-memory log)

pub mod committer;
pub mod config;
pub mod content;
pub mod error;
pub mod events;
pub mod gate;
pub mod history;
pub mod interlock;
pub mod lock;
pub mod staging;
pub mod sync;
pub mod transaction;

pub use committer::HistoryCommitter;
pub use config::{ConfigError, GitConfig, StashConfig, SyncConfig, TransactionConfig};
pub use content::{ContentError, ContentStore, LocalContentStore};
pub use error::{Result, TxnError};
pub use events::{ChangeEvent, ChangeKind, ChangeOrigin, EventBus};
pub use gate::ContentGate;
pub use history::{
    BlameLine, CommitId, GitHistory, HistoryBackend, HistoryError, Identity, LogEntry,
    MemoryHistory, PullResult,
};
pub use interlock::{Interlock, InterlockGuard};
pub use lock::{LockManager, Outcome, SyncLease, TxnStatus};
pub use staging::{AppliedSet, Journal, PathChange, StagingLayer};
pub use sync::{SyncScheduler, SyncStats, TickOutcome};
pub use transaction::{Holder, OpKind, Operation, Transaction, TxnId, TxnState};
