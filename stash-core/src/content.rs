//! Filesystem collaborator for the content tree.
//!
//! Paths handed to a [`ContentStore`] are logical: relative to the content
//! root, `/`-separated, with no `..`, absolute prefixes, or `.git` segments.
//! [`normalize_path`] is the single place that enforces that shape.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Result type for content operations
pub type Result<T> = std::result::Result<T, ContentError>;

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ContentError {
    fn io(path: &str, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            ContentError::NotFound(path.to_string())
        } else {
            ContentError::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

/// Live content tree the write gate mutates.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Replace (or create) the file at `path`, creating parent directories.
    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn rename(&self, src: &str, dest: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// All files under the root, sorted, hidden entries excluded.
    async fn list_files(&self) -> Result<Vec<String>>;
}

/// Read a file, mapping a missing one to `None`.
pub async fn read_optional(store: &dyn ContentStore, path: &str) -> Result<Option<Bytes>> {
    match store.read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(ContentError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Normalize a caller-supplied path into its logical form.
///
/// A leading `/` is tolerated and stripped; `.` segments are dropped.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim().trim_start_matches('/');
    let mut parts = Vec::new();

    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| ContentError::InvalidPath(path.to_string()))?;
                if part == ".git" {
                    return Err(ContentError::InvalidPath(path.to_string()));
                }
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ContentError::InvalidPath(path.to_string()));
            }
        }
    }

    if parts.is_empty() {
        return Err(ContentError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

/// Content tree rooted at a local directory.
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    /// Open (creating if needed) a content tree at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let display = root.display().to_string();
        std::fs::create_dir_all(root).map_err(|e| ContentError::io(&display, e))?;
        let root = root
            .canonicalize()
            .map_err(|e| ContentError::io(&display, e))?;

        tracing::info!("Content store opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf)> {
        let logical = normalize_path(path)?;
        let full = self.root.join(&logical);
        Ok((logical, full))
    }

    /// Remove now-empty directories between `full`'s parent and the root.
    async fn prune_empty_parents(&self, full: &Path) {
        let mut dir = full.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            if tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            tracing::debug!("Pruned empty directory {}", current.display());
            dir = current.parent();
        }
    }
}

fn temp_sibling(full: &Path) -> PathBuf {
    let name = full
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    full.with_file_name(format!(".{}.stash-tmp", name))
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let (logical, full) = self.resolve(path)?;
        let data = tokio::fs::read(&full)
            .await
            .map_err(|e| ContentError::io(&logical, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let (logical, full) = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ContentError::io(&logical, e))?;
        }

        // Atomic write via temp file + rename
        let tmp = temp_sibling(&full);
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| ContentError::io(&logical, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &full).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ContentError::io(&logical, e));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let (logical, full) = self.resolve(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| ContentError::io(&logical, e))?;
        self.prune_empty_parents(&full).await;
        Ok(())
    }

    async fn rename(&self, src: &str, dest: &str) -> Result<()> {
        let (src_logical, src_full) = self.resolve(src)?;
        let (dest_logical, dest_full) = self.resolve(dest)?;

        if !self.exists(&src_logical).await? {
            return Err(ContentError::NotFound(src_logical));
        }
        if let Some(parent) = dest_full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ContentError::io(&dest_logical, e))?;
        }
        tokio::fs::rename(&src_full, &dest_full)
            .await
            .map_err(|e| ContentError::io(&src_logical, e))?;
        self.prune_empty_parents(&src_full).await;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let (logical, full) = self.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ContentError::io(&logical, e)),
        }
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let display = dir.display().to_string();
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| ContentError::io(&display, e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ContentError::io(&display, e))?
            {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| ContentError::io(&display, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        let parts: Vec<_> = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect();
                        files.push(parts.join("/"));
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("notes/a.md").unwrap(), "notes/a.md");
        assert_eq!(normalize_path("/notes/./a.md").unwrap(), "notes/a.md");
        assert!(matches!(
            normalize_path("../escape.md"),
            Err(ContentError::InvalidPath(_))
        ));
        assert!(matches!(
            normalize_path("notes/../../x"),
            Err(ContentError::InvalidPath(_))
        ));
        assert!(matches!(
            normalize_path(".git/config"),
            Err(ContentError::InvalidPath(_))
        ));
        assert!(matches!(normalize_path("/"), Err(ContentError::InvalidPath(_))));
        assert!(matches!(normalize_path(""), Err(ContentError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let tmp = TempDir::new().unwrap();
        let store = LocalContentStore::open(tmp.path()).unwrap();

        store
            .write("deep/dir/a.md", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(store.exists("deep/dir/a.md").await.unwrap());
        assert_eq!(store.read("deep/dir/a.md").await.unwrap(), "hello");

        store.delete("deep/dir/a.md").await.unwrap();
        assert!(!store.exists("deep/dir/a.md").await.unwrap());
        // empty parents pruned
        assert!(!tmp.path().join("deep").exists());

        assert!(matches!(
            store.read("deep/dir/a.md").await,
            Err(ContentError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("missing.md").await,
            Err(ContentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = LocalContentStore::open(tmp.path()).unwrap();

        store.write("a.md", Bytes::from_static(b"one")).await.unwrap();
        store.write("a.md", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(store.read("a.md").await.unwrap(), "two");
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.md".to_string()]);
    }

    #[tokio::test]
    async fn test_rename() {
        let tmp = TempDir::new().unwrap();
        let store = LocalContentStore::open(tmp.path()).unwrap();

        store.write("old/a.md", Bytes::from_static(b"x")).await.unwrap();
        store.rename("old/a.md", "new/b.md").await.unwrap();

        assert!(!store.exists("old/a.md").await.unwrap());
        assert_eq!(store.read("new/b.md").await.unwrap(), "x");
        assert!(!tmp.path().join("old").exists());

        assert!(matches!(
            store.rename("old/a.md", "c.md").await,
            Err(ContentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_files_skips_hidden() {
        let tmp = TempDir::new().unwrap();
        let store = LocalContentStore::open(tmp.path()).unwrap();

        store.write("b.md", Bytes::from_static(b"b")).await.unwrap();
        store.write("a/c.md", Bytes::from_static(b"c")).await.unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(tmp.path().join(".hidden"), "h").unwrap();

        let files = store.list_files().await.unwrap();
        assert_eq!(files, vec!["a/c.md".to_string(), "b.md".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let store = LocalContentStore::open(tmp.path()).unwrap();

        let err = store
            .write("../outside.md", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::InvalidPath(_)));
        assert!(matches!(
            store.exists(".git/HEAD").await,
            Err(ContentError::InvalidPath(_))
        ));
    }
}
