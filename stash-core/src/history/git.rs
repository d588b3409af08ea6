//! Git-backed history, driven through the `git` command line.

use super::{
    BlameLine, CommitId, HistoryBackend, HistoryError, Identity, LogEntry, PullResult, Result,
    parse_blame_porcelain, parse_name_status,
};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const CREDENTIAL_HELPER: &str = "stash-credential-helper.sh";

/// `[main (root-commit) 1a2b3c4] subject`, as printed by `git commit`.
static COMMIT_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\[[^\]\n]*\s([0-9a-f]{7,64})\]").expect("summary pattern is valid")
});

const AUTH_FAILURE_MARKERS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "permission denied",
    "invalid credentials",
    "403",
];

/// History stored in the git repository that holds the content tree.
pub struct GitHistory {
    workdir: PathBuf,
}

impl GitHistory {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output)
    }

    /// Run git, returning stdout or a `Command` error carrying stderr.
    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(command_error(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn head(&self) -> Option<String> {
        self.run_checked(&["rev-parse", "HEAD"])
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Check the working directory is a repository and give it a committer
    /// identity if it has none.
    pub async fn validate(&self, default_author: &Identity) -> Result<()> {
        let inside = self.run(&["rev-parse", "--is-inside-work-tree"]).await?;
        if !inside.status.success() {
            return Err(HistoryError::NotARepository(
                self.workdir.display().to_string(),
            ));
        }

        let name = self.run(&["config", "user.name"]).await?;
        if !name.status.success() || name.stdout.trim_ascii().is_empty() {
            self.run_checked(&["config", "user.name", default_author.name.as_str()])
                .await?;
            tracing::info!("Set repository user.name to {}", default_author.name);
        }
        let email = self.run(&["config", "user.email"]).await?;
        if !email.status.success() || email.stdout.trim_ascii().is_empty() {
            self.run_checked(&["config", "user.email", default_author.email.as_str()])
                .await?;
            tracing::info!("Set repository user.email to {}", default_author.email);
        }

        tracing::info!("Git repository validated at {}", self.workdir.display());
        Ok(())
    }

    /// Clone `url` at `branch` into `target` and return its history.
    ///
    /// A `target` that already holds a repository is used as is. Any other
    /// non-empty directory is refused. The token is handed to git through a
    /// credential helper, then installed in the clone for later pulls.
    pub async fn clone_into(
        target: &Path,
        url: &str,
        branch: &str,
        token: Option<&str>,
        recursive: bool,
    ) -> Result<Self> {
        if has_entries(target).await? {
            if tokio::fs::try_exists(target.join(".git")).await? {
                tracing::info!(
                    "{} already holds a git repository, skipping clone",
                    target.display()
                );
                return Ok(Self::new(target));
            }
            return Err(HistoryError::TargetNotEmpty(target.display().to_string()));
        }

        let Some(name) = target.file_name() else {
            return Err(HistoryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no directory name in {}", target.display()),
            )));
        };
        let parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent).await?;
        let parent = tokio::fs::canonicalize(&parent).await?;
        let destination = parent.join(name);
        let runner = Self::new(&parent);

        let helper = match token {
            Some(token) => {
                let path = std::env::temp_dir()
                    .join(format!("stash-clone-{}.sh", uuid::Uuid::new_v4()));
                write_helper(&path, token).await?;
                Some(path)
            }
            None => None,
        };
        let helper_arg = helper
            .as_ref()
            .map(|path| format!("credential.helper={}", path.display()));
        let destination = destination.to_string_lossy().into_owned();

        let mut args = Vec::new();
        if let Some(arg) = &helper_arg {
            args.extend(["-c", "credential.helper=", "-c", arg.as_str()]);
        }
        args.extend(["clone", "-q", "--branch", branch]);
        if recursive {
            args.push("--recurse-submodules");
        }
        args.extend(["--", url, destination.as_str()]);

        tracing::info!("Cloning {} (branch {}) into {}", url, branch, target.display());
        let output = runner.run(&args).await;
        if let Some(path) = &helper {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        let output = output?;
        if !output.status.success() {
            let err = command_error(&["clone"], &output);
            if let HistoryError::Command { stderr, .. } = &err {
                if is_auth_failure(stderr) {
                    return Err(HistoryError::Authentication {
                        remote: url.to_string(),
                        detail: stderr.clone(),
                    });
                }
            }
            return Err(err);
        }

        let history = Self::new(target);
        if let Some(token) = token {
            history.install_credentials(token).await?;
        }
        tracing::info!("Cloned {} into {}", url, target.display());
        Ok(history)
    }

    /// Install a repository-local credential helper answering with `token`.
    ///
    /// The token is written to a 0700 script inside the git directory so it
    /// never appears on a command line.
    pub async fn install_credentials(&self, token: &str) -> Result<PathBuf> {
        let git_dir = self
            .run_checked(&["rev-parse", "--absolute-git-dir"])
            .await?;
        let helper = PathBuf::from(git_dir.trim()).join(CREDENTIAL_HELPER);
        write_helper(&helper, token).await?;

        let helper_str = helper.to_string_lossy().into_owned();
        self.run_checked(&["config", "credential.helper", helper_str.as_str()])
            .await?;
        tracing::info!("Installed credential helper at {}", helper.display());
        Ok(helper)
    }

    /// Id of the commit `git commit` just created. The commit exists at this
    /// point, so a failed lookup falls back to the id git printed.
    async fn committed_id(&self, summary: &str) -> CommitId {
        match self.run_checked(&["rev-parse", "HEAD"]).await {
            Ok(head) => CommitId::new(head.trim()),
            Err(e) => {
                let printed = parse_commit_summary(summary).unwrap_or("HEAD");
                tracing::warn!(
                    "Could not resolve HEAD after commit ({}), recording it as {}",
                    e,
                    printed
                );
                CommitId::new(printed)
            }
        }
    }

    /// Unified diff of `path` between `rev` (default `HEAD~1`) and the work tree.
    pub async fn diff(&self, path: &str, rev: Option<&str>) -> Result<String> {
        let rev = rev.unwrap_or("HEAD~1");
        self.run_checked(&["diff", rev, "--", path]).await
    }

    /// Per-line blame for `path`, optionally limited to the 1-based inclusive
    /// `lines` range.
    pub async fn blame(
        &self,
        path: &str,
        lines: Option<(usize, usize)>,
    ) -> Result<Vec<BlameLine>> {
        let range = lines.map(|(start, end)| format!("{},{}", start, end));
        let mut args = vec!["blame", "--porcelain"];
        if let Some(range) = &range {
            args.extend(["-L", range.as_str()]);
        }
        args.extend(["--", path]);
        let output = self.run_checked(&args).await?;
        Ok(parse_blame_porcelain(&output))
    }

    async fn unstage(&self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        let mut args = vec!["reset", "-q", "--"];
        args.extend(paths.iter().map(String::as_str));
        if let Err(e) = self.run_checked(&args).await {
            tracing::warn!("Failed to unstage paths after a rejected commit: {}", e);
        }
    }

    /// Put the work tree back where it was before a failed pull.
    async fn restore_after_failed_pull(&self, old_head: Option<&str>) {
        // No-op when no merge is in progress.
        let _ = self.run(&["merge", "--abort"]).await;

        if let Some(old) = old_head {
            if self.head().await.as_deref() != Some(old) {
                match self.run_checked(&["reset", "--hard", old]).await {
                    Ok(_) => tracing::info!("Restored HEAD to {} after failed pull", old),
                    Err(e) => tracing::error!("Failed to restore HEAD to {}: {}", old, e),
                }
            }
        }
    }
}

fn command_error(args: &[&str], output: &Output) -> HistoryError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stderr = if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    };
    HistoryError::Command {
        command: format!("git {}", args.first().copied().unwrap_or_default()),
        stderr,
    }
}

/// Write a 0700 credential helper script answering with `token`.
async fn write_helper(path: &Path, token: &str) -> Result<()> {
    let script = format!(
        "#!/bin/sh\necho username=x-access-token\necho password={}\n",
        shell_quote(token)
    );
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o700);
    let mut file = options.open(path).await?;
    file.write_all(script.as_bytes()).await?;
    file.flush().await?;

    // mode only applies when the file is created
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

async fn has_entries(dir: &Path) -> Result<bool> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(entries.next_entry().await?.is_some())
}

fn parse_commit_summary(stdout: &str) -> Option<&str> {
    COMMIT_SUMMARY_RE
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn is_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    AUTH_FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}

#[async_trait]
impl HistoryBackend for GitHistory {
    async fn record(
        &self,
        changed_paths: &[String],
        author: &Identity,
        message: &str,
    ) -> Result<CommitId> {
        let mut present = Vec::new();
        let mut removed = Vec::new();
        for path in changed_paths {
            if tokio::fs::try_exists(self.workdir.join(path)).await? {
                present.push(path.as_str());
            } else {
                removed.push(path.as_str());
            }
        }

        let staged = async {
            if !present.is_empty() {
                let mut args = vec!["add", "--"];
                args.extend(&present);
                self.run_checked(&args).await?;
            }
            if !removed.is_empty() {
                let mut args = vec!["rm", "--cached", "-q", "--ignore-unmatch", "--"];
                args.extend(&removed);
                self.run_checked(&args).await?;
            }
            let author = author.to_string();
            self.run_checked(&[
                "commit",
                "--allow-empty",
                "-m",
                message,
                "--author",
                author.as_str(),
            ])
            .await
        }
        .await;

        let summary = match staged {
            Ok(summary) => summary,
            Err(e) => {
                self.unstage(changed_paths).await;
                return Err(e);
            }
        };

        let id = self.committed_id(&summary).await;
        tracing::info!("Committed {} ({} paths)", id.short(), changed_paths.len());
        Ok(id)
    }

    async fn pull(&self, remote: &str, branch: &str, recursive: bool) -> Result<PullResult> {
        let old_head = self.head().await;

        let mut args = vec!["pull", "--no-rebase", "--no-edit", remote, branch];
        if recursive {
            args.push("--recurse-submodules");
        }
        let output = self.run(&args).await?;

        if !output.status.success() {
            self.restore_after_failed_pull(old_head.as_deref()).await;
            let err = command_error(&args, &output);
            if let HistoryError::Command { stderr, .. } = &err {
                if is_auth_failure(stderr) {
                    return Err(HistoryError::Authentication {
                        remote: remote.to_string(),
                        detail: stderr.clone(),
                    });
                }
            }
            return Err(err);
        }

        let new_head = self.head().await;
        let mut result = match (&old_head, &new_head) {
            (Some(old), Some(new)) if old != new => {
                let range = format!("{}..{}", old, new);
                let diff = self
                    .run_checked(&["diff", "--name-status", range.as_str()])
                    .await?;
                parse_name_status(&diff)
            }
            (None, Some(new)) => {
                let files = self
                    .run_checked(&["ls-tree", "-r", "--name-only", new.as_str()])
                    .await?;
                PullResult {
                    added: files.lines().map(str::to_string).collect(),
                    ..Default::default()
                }
            }
            _ => PullResult::default(),
        };
        result.message = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(result)
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        let args = ["push", remote, branch];
        let output = self.run(&args).await?;
        if !output.status.success() {
            let err = command_error(&args, &output);
            if let HistoryError::Command { stderr, .. } = &err {
                if is_auth_failure(stderr) {
                    return Err(HistoryError::Authentication {
                        remote: remote.to_string(),
                        detail: stderr.clone(),
                    });
                }
            }
            return Err(err);
        }
        tracing::info!("Pushed {} to {}", branch, remote);
        Ok(())
    }

    async fn log(&self, path: Option<&str>, max_count: usize) -> Result<Vec<LogEntry>> {
        if self.head().await.is_none() {
            return Ok(Vec::new());
        }

        let max = format!("--max-count={}", max_count);
        let mut args = vec!["log", max.as_str(), "--format=%H%x00%an%x00%at%x00%s"];
        if let Some(path) = path {
            args.push("--");
            args.push(path);
        }
        let output = self.run_checked(&args).await?;

        Ok(output
            .lines()
            .filter_map(|line| {
                let mut fields = line.splitn(4, '\0');
                let id = fields.next()?;
                let author = fields.next()?;
                let timestamp = fields.next()?.parse().ok()?;
                let message = fields.next().unwrap_or_default();
                Some(LogEntry {
                    commit_id: CommitId::new(id),
                    author: author.to_string(),
                    timestamp,
                    message: message.to_string(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn test_parse_commit_summary() {
        let out = "[main (root-commit) 1a2b3c4] Add a\n 1 file changed, 1 insertion(+)\n";
        assert_eq!(parse_commit_summary(out), Some("1a2b3c4"));
        assert_eq!(
            parse_commit_summary("[feature/x 0123456789ab] Fix\n"),
            Some("0123456789ab")
        );
        assert_eq!(
            parse_commit_summary("[detached HEAD deadbeef] msg"),
            Some("deadbeef")
        );
        assert_eq!(parse_commit_summary("nothing to see"), None);
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(is_auth_failure(
            "fatal: Authentication failed for 'https://example.com/repo.git/'"
        ));
        assert!(is_auth_failure("remote: Permission denied to user"));
        assert!(!is_auth_failure("CONFLICT (content): Merge conflict in a.md"));
    }
}
