//! JSON batch files for `stash apply`.
//!
//! ```json
//! {
//!   "message": "Reorganize notes",
//!   "author": "Ada <ada@example.com>",
//!   "operations": [
//!     { "op": "create", "path": "a.md", "content": "x" },
//!     { "op": "move", "path": "b.md", "dest": "archive/b.md" }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use stash_core::Operation;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOp {
    Create { path: String, content: String },
    Update { path: String, content: String },
    Delete { path: String },
    Move { path: String, dest: String },
}

impl From<BatchOp> for Operation {
    fn from(op: BatchOp) -> Self {
        match op {
            BatchOp::Create { path, content } => Operation::create(path, content),
            BatchOp::Update { path, content } => Operation::update(path, content),
            BatchOp::Delete { path } => Operation::delete(path),
            BatchOp::Move { path, dest } => Operation::rename(path, dest),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Batch {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    pub operations: Vec<BatchOp>,
}

impl Batch {
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid batch file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read batch file {}", path.display()))?;
        Self::parse(&content)
    }
}
