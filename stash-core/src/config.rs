//! Configuration: TOML file with defaults, then `STASH_*` environment overrides.

use crate::history::Identity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    /// Root of the content tree (also the git work tree)
    pub content_root: PathBuf,
    pub transaction: TransactionConfig,
    pub git: GitConfig,
    pub sync: SyncConfig,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from("/data/content"),
            transaction: TransactionConfig::default(),
            git: GitConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Seconds a transaction may stay active before it expires
    pub timeout_secs: u64,
    /// Seconds `begin` waits for the lock
    pub lock_wait_secs: u64,
    pub watchdog_interval_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            lock_wait_secs: 30,
            watchdog_interval_ms: 1000,
        }
    }
}

impl TransactionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// `"Name <email>"` used when a transaction carries no author
    pub author_default: String,
    /// Push to the sync remote after every commit
    pub push_after_commit: bool,
    /// Repository cloned into an empty content root at startup
    pub clone_url: Option<String>,
    pub clone_branch: String,
    /// Access token for the clone; never serialized back out
    #[serde(skip_serializing)]
    pub clone_token: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_default: "stash <stash@local>".to_string(),
            push_after_commit: false,
            clone_url: None,
            clone_branch: "main".to_string(),
            clone_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub remote: String,
    pub branch: String,
    pub interval_secs: u64,
    /// Also update submodules on pull
    pub recursive: bool,
    /// Milliseconds a tick waits for the lock before skipping
    pub lock_wait_ms: u64,
    /// Access token for the remote; never serialized back out
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote: "origin".to_string(),
            branch: "main".to_string(),
            interval_secs: 60,
            recursive: false,
            lock_wait_ms: 500,
            token: None,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl StashConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load `path` (or defaults), apply process environment overrides, validate.
    pub fn from_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STASH_*` overrides looked up through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("STASH_CONTENT_ROOT") {
            self.content_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("STASH_TRANSACTION_TIMEOUT") {
            self.transaction.timeout_secs = parse_u64("STASH_TRANSACTION_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("STASH_TRANSACTION_LOCK_WAIT") {
            self.transaction.lock_wait_secs = parse_u64("STASH_TRANSACTION_LOCK_WAIT", &v)?;
        }
        if let Some(v) = lookup("STASH_GIT_AUTHOR_DEFAULT") {
            self.git.author_default = v;
        }
        if let Some(v) = lookup("STASH_GIT_PUSH_AFTER_COMMIT") {
            self.git.push_after_commit = parse_bool("STASH_GIT_PUSH_AFTER_COMMIT", &v)?;
        }
        if let Some(v) = lookup("STASH_GIT_CLONE_URL") {
            self.git.clone_url = Some(v).filter(|u| !u.is_empty());
        }
        if let Some(v) = lookup("STASH_GIT_CLONE_BRANCH") {
            self.git.clone_branch = v;
        }
        if let Some(v) = lookup("STASH_GIT_CLONE_TOKEN") {
            self.git.clone_token = Some(v).filter(|t| !t.is_empty());
        }
        if let Some(v) = lookup("STASH_GIT_SYNC_ENABLED") {
            self.sync.enabled = parse_bool("STASH_GIT_SYNC_ENABLED", &v)?;
        }
        if let Some(v) = lookup("STASH_GIT_SYNC_REMOTE") {
            self.sync.remote = v;
        }
        if let Some(v) = lookup("STASH_GIT_SYNC_BRANCH") {
            self.sync.branch = v;
        }
        if let Some(v) = lookup("STASH_GIT_SYNC_INTERVAL") {
            self.sync.interval_secs = parse_u64("STASH_GIT_SYNC_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("STASH_GIT_SYNC_RECURSIVE") {
            self.sync.recursive = parse_bool("STASH_GIT_SYNC_RECURSIVE", &v)?;
        }
        if let Some(v) = lookup("STASH_GIT_SYNC_TOKEN") {
            self.sync.token = Some(v).filter(|t| !t.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("transaction.timeout_secs", self.transaction.timeout_secs),
            (
                "transaction.watchdog_interval_ms",
                self.transaction.watchdog_interval_ms,
            ),
            ("sync.interval_secs", self.sync.interval_secs),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: "0".to_string(),
                });
            }
        }
        if self.sync.enabled && (self.sync.remote.is_empty() || self.sync.branch.is_empty()) {
            return Err(ConfigError::Invalid {
                key: "sync".to_string(),
                value: "remote and branch are required when sync is enabled".to_string(),
            });
        }
        if self.git.clone_url.is_some() && self.git.clone_branch.is_empty() {
            return Err(ConfigError::Invalid {
                key: "git.clone_branch".to_string(),
                value: String::new(),
            });
        }
        Ok(())
    }

    pub fn default_author(&self) -> Identity {
        Identity::parse(&self.git.author_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = StashConfig::default();
        assert_eq!(config.transaction.ttl(), Duration::from_secs(300));
        assert_eq!(config.transaction.lock_wait(), Duration::from_secs(30));
        assert!(!config.sync.enabled);
        assert_eq!(config.default_author().email, "stash@local");
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StashConfig::from_toml_str(
            r#"
            content_root = "/srv/notes"

            [transaction]
            timeout_secs = 60

            [sync]
            enabled = true
            branch = "trunk"
            "#,
        )
        .unwrap();

        assert_eq!(config.content_root, PathBuf::from("/srv/notes"));
        assert_eq!(config.transaction.timeout_secs, 60);
        assert_eq!(config.transaction.lock_wait_secs, 30);
        assert!(config.sync.enabled);
        assert_eq!(config.sync.remote, "origin");
        assert_eq!(config.sync.branch, "trunk");
    }

    #[test]
    fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stash.toml");
        std::fs::write(&path, "[git]\nauthor_default = \"Bot <bot@x.io>\"\n").unwrap();

        let config = StashConfig::load(&path).unwrap();
        assert_eq!(config.default_author(), Identity::new("Bot", "bot@x.io"));

        assert!(matches!(
            StashConfig::load(&tmp.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STASH_CONTENT_ROOT", "/tmp/content"),
            ("STASH_TRANSACTION_TIMEOUT", "90"),
            ("STASH_GIT_SYNC_ENABLED", "true"),
            ("STASH_GIT_SYNC_INTERVAL", "15"),
            ("STASH_GIT_SYNC_TOKEN", "secret"),
            ("STASH_GIT_PUSH_AFTER_COMMIT", "yes"),
        ]
        .into_iter()
        .collect();

        let mut config = StashConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.content_root, PathBuf::from("/tmp/content"));
        assert_eq!(config.transaction.timeout_secs, 90);
        assert!(config.sync.enabled);
        assert_eq!(config.sync.interval(), Duration::from_secs(15));
        assert_eq!(config.sync.token.as_deref(), Some("secret"));
        assert!(config.git.push_after_commit);
    }

    #[test]
    fn test_clone_settings() {
        let env: HashMap<&str, &str> = [
            ("STASH_GIT_CLONE_URL", "https://example.com/notes.git"),
            ("STASH_GIT_CLONE_TOKEN", "tok"),
        ]
        .into_iter()
        .collect();

        let mut config = StashConfig::default();
        assert_eq!(config.git.clone_url, None);
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(
            config.git.clone_url.as_deref(),
            Some("https://example.com/notes.git")
        );
        assert_eq!(config.git.clone_branch, "main");
        assert!(!toml::to_string(&config).unwrap().contains("tok\""));

        config.git.clone_branch.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "git.clone_branch"
        ));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = StashConfig::default();
        let err = config
            .apply_overrides(|key| (key == "STASH_GIT_SYNC_ENABLED").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "STASH_GIT_SYNC_ENABLED"));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = StashConfig::default();
        config.transaction.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_not_serialized() {
        let mut config = StashConfig::default();
        config.sync.token = Some("secret".to_string());
        let rendered = toml::to_string(&config).unwrap();
        assert!(!rendered.contains("secret"));
    }
}
