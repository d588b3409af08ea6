#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use stash_core::content::{ContentError, ContentStore, LocalContentStore};
use stash_core::{ContentGate, Interlock, MemoryHistory, StashConfig, SyncConfig};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Local store that can be told to fail writes to chosen paths. Successful
/// writes are logged in order.
pub struct FaultyStore {
    inner: LocalContentStore,
    failing: Mutex<HashSet<String>>,
    written: Mutex<Vec<String>>,
}

impl FaultyStore {
    pub fn open(root: &Path) -> Self {
        Self {
            inner: LocalContentStore::open(root).unwrap(),
            failing: Mutex::new(HashSet::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    pub fn fail_writes_to(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }
}

#[async_trait]
impl ContentStore for FaultyStore {
    async fn read(&self, path: &str) -> Result<Bytes, ContentError> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), ContentError> {
        if self.failing.lock().contains(path) {
            return Err(ContentError::Io {
                path: path.to_string(),
                source: std::io::Error::other("injected write failure"),
            });
        }
        self.inner.write(path, data).await?;
        self.written.lock().push(path.to_string());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), ContentError> {
        self.inner.delete(path).await
    }

    async fn rename(&self, src: &str, dest: &str) -> Result<(), ContentError> {
        self.inner.rename(src, dest).await
    }

    async fn exists(&self, path: &str) -> Result<bool, ContentError> {
        self.inner.exists(path).await
    }

    async fn list_files(&self) -> Result<Vec<String>, ContentError> {
        self.inner.list_files().await
    }
}

pub struct Fixture {
    pub tmp: TempDir,
    pub store: Arc<FaultyStore>,
    pub history: Arc<MemoryHistory>,
    pub gate: Arc<ContentGate>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: StashConfig) -> Self {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FaultyStore::open(tmp.path()));
        let history = Arc::new(MemoryHistory::new());
        let gate = Arc::new(ContentGate::new(store.clone(), history.clone(), &config));
        Self {
            tmp,
            store,
            history,
            gate,
        }
    }

    /// A fixture whose gate takes the root's interlock.
    pub fn interlocked() -> Self {
        let mut fx = Self::new();
        fx.gate = fx.interlocked_gate();
        fx
    }

    /// Another interlocked gate over the same tree and history, as a second
    /// process would build it.
    pub fn interlocked_gate(&self) -> Arc<ContentGate> {
        Arc::new(ContentGate::interlocked(
            self.store.clone(),
            self.history.clone(),
            &test_config(),
            Interlock::for_root(self.tmp.path()),
        ))
    }

    pub async fn seed(&self, path: &str, content: &'static str) {
        self.store
            .write(path, Bytes::from_static(content.as_bytes()))
            .await
            .unwrap();
    }

    /// Sync settings with a short lock wait, for driving ticks by hand.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            enabled: true,
            lock_wait_ms: 20,
            ..Default::default()
        }
    }

    pub async fn read(&self, path: &str) -> Option<String> {
        match self.store.read(path).await {
            Ok(data) => Some(String::from_utf8(data.to_vec()).unwrap()),
            Err(ContentError::NotFound(_)) => None,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
}

pub fn test_config() -> StashConfig {
    let mut config = StashConfig::default();
    config.transaction.timeout_secs = 30;
    config.transaction.lock_wait_secs = 5;
    config.transaction.watchdog_interval_ms = 50;
    config
}
