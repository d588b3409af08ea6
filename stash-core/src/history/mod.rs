//! History collaborator: an append-only log of recorded changes that can be
//! synchronized with a remote.

pub mod git;
pub mod memory;

pub use git::GitHistory;
pub use memory::MemoryHistory;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

/// Result type for history operations
pub type Result<T> = std::result::Result<T, HistoryError>;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// External command exited unsuccessfully
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Authentication failed for remote {remote}: {detail}")]
    Authentication { remote: String, detail: String },

    #[error("Not a history repository: {0}")]
    NotARepository(String),

    #[error("Refusing to clone into non-empty directory {0}")]
    TargetNotEmpty(String),

    /// The backend refused the entry (hook rejection, injected failure, ...)
    #[error("History rejected the change: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifier of a recorded history entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author identity attached to history entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

static AUTHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(.*?)\s*<([^<>]*)>\s*$").expect("author pattern is valid")
});

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Parse `"Name <email>"`. Anything else becomes a name with a
    /// placeholder address.
    pub fn parse(author: &str) -> Self {
        if let Some(caps) = AUTHOR_RE.captures(author) {
            let name = caps[1].to_string();
            let email = caps[2].trim().to_string();
            let name = if name.is_empty() { email.clone() } else { name };
            return Self { name, email };
        }
        Self {
            name: author.trim().to_string(),
            email: "unknown@local".to_string(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Paths changed by a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullResult {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    /// Backend output, for operator logs
    pub message: String,
}

impl PullResult {
    pub fn is_up_to_date(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn changed_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .added
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .cloned()
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub commit_id: CommitId,
    pub author: String,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
    pub message: String,
}

/// Last change to one line of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlameLine {
    /// 1-based line number in the current file
    pub line_number: usize,
    pub commit_id: CommitId,
    pub author: String,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
    pub summary: String,
    pub content: String,
}

/// Durable, append-only change history.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// Record the current state of `changed_paths` as one entry.
    ///
    /// An empty path list still produces an entry. On error nothing is
    /// recorded.
    async fn record(
        &self,
        changed_paths: &[String],
        author: &Identity,
        message: &str,
    ) -> Result<CommitId>;

    /// Fetch and integrate remote history. On error the local tree is left as
    /// it was before the call.
    async fn pull(&self, remote: &str, branch: &str, recursive: bool) -> Result<PullResult>;

    async fn push(&self, remote: &str, branch: &str) -> Result<()>;

    /// Most recent entries first, optionally restricted to one path.
    async fn log(&self, path: Option<&str>, max_count: usize) -> Result<Vec<LogEntry>>;
}

/// Parse `--name-status` diff output into a [`PullResult`].
pub(crate) fn parse_name_status(output: &str) -> PullResult {
    let mut result = PullResult::default();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let (Some(status), Some(path)) = (fields.next(), fields.next()) else {
            continue;
        };
        match status.chars().next() {
            Some('A') | Some('C') => result.added.push(path.to_string()),
            Some('D') => result.deleted.push(path.to_string()),
            Some('R') => {
                result.deleted.push(path.to_string());
                if let Some(dest) = fields.next() {
                    result.added.push(dest.to_string());
                }
            }
            Some(_) => result.modified.push(path.to_string()),
            None => {}
        }
    }
    result
}

#[derive(Debug, Clone, Default)]
struct BlameCommit {
    author: String,
    timestamp: i64,
    summary: String,
}

/// Parse `git blame --porcelain` output.
///
/// Commit details are only printed the first time a commit appears, so they
/// are remembered by hash for later lines.
pub(crate) fn parse_blame_porcelain(output: &str) -> Vec<BlameLine> {
    let mut commits: HashMap<&str, BlameCommit> = HashMap::new();
    let mut current: Option<(&str, usize)> = None;
    let mut lines = Vec::new();

    for raw in output.lines() {
        if let Some(content) = raw.strip_prefix('\t') {
            if let Some((hash, line_number)) = current.take() {
                let commit = commits.get(hash).cloned().unwrap_or_default();
                lines.push(BlameLine {
                    line_number,
                    commit_id: CommitId::new(hash),
                    author: commit.author,
                    timestamp: commit.timestamp,
                    summary: commit.summary,
                    content: content.to_string(),
                });
            }
            continue;
        }

        let mut fields = raw.split(' ');
        let first = fields.next().unwrap_or_default();
        if matches!(first.len(), 40 | 64) && first.bytes().all(|b| b.is_ascii_hexdigit()) {
            if let Some(line_number) = fields.nth(1).and_then(|n| n.parse().ok()) {
                commits.entry(first).or_default();
                current = Some((first, line_number));
            }
            continue;
        }

        let Some(commit) = current.and_then(|(hash, _)| commits.get_mut(hash)) else {
            continue;
        };
        match raw.split_once(' ') {
            Some(("author", name)) => commit.author = name.to_string(),
            Some(("author-time", time)) => commit.timestamp = time.parse().unwrap_or_default(),
            Some(("summary", summary)) => commit.summary = summary.to_string(),
            _ => {}
        }
    }
    lines
}
