//! In-memory virtual artifact store.
//!
//! Generation jobs are written against a hierarchical filesystem: they persist
//! conversation logs, outlines, drafts and polished articles under a per-topic
//! directory. [`MemoryStore`] satisfies the same read/write/list/delete
//! contract without touching persistent storage. One store is created per run
//! and dropped when the run's worker finishes, so no two requests ever observe
//! the same instance.
//!
//! Every operation goes through a single [`parking_lot::Mutex`] owned by the
//! store instance. The lock is never shared across runs.

use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Default per-artifact size guard (1 GiB).
pub const DEFAULT_MAX_ARTIFACT_BYTES: usize = 1 << 30;

/// File names a finished article may be stored under, best first.
const ARTICLE_CANDIDATES: [&str; 3] = [
    "storm_gen_article_polished.txt",
    "polished_article.txt",
    "storm_gen_article.txt",
];

/// One stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFile {
    pub path: String,
    pub bytes: Bytes,
    pub modified_at: DateTime<Utc>,
}

/// The file I/O capability handed to a generation job.
pub trait ArtifactStore: Send + Sync {
    /// Creates or overwrites the artifact at `path`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::StoreCapacityExceeded`] when `bytes` is larger than
    /// the store's per-artifact ceiling and with [`Error::InvalidPath`] when
    /// `path` normalizes to nothing.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Returns the current contents of `path`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] if `path` was never written or was
    /// deleted.
    fn read(&self, path: &str) -> Result<Bytes>;

    /// Paths under the logical directory `prefix`, in insertion order.
    fn list(&self, prefix: &str) -> Vec<String>;

    /// Removes `path`. Removing a missing path is a no-op.
    fn delete(&self, path: &str);

    fn exists(&self, path: &str) -> bool;

    /// Writes UTF-8 text.
    ///
    /// # Errors
    ///
    /// See [`ArtifactStore::write`].
    fn write_str(&self, path: &str, contents: &str) -> Result<()> {
        self.write(path, contents.as_bytes())
    }

    /// Reads an artifact as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Fails like [`ArtifactStore::read`], or with [`Error::Internal`] if the
    /// contents are not valid UTF-8.
    fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Internal(format!("Artifact '{path}' is not valid UTF-8")))
    }
}

#[derive(Debug, Default)]
struct Entries {
    files: HashMap<String, VirtualFile>,
    // Insertion order of the keys in `files`.
    order: Vec<String>,
}

/// Mutex-guarded, insertion-ordered [`ArtifactStore`].
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
    max_artifact_bytes: usize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_ARTIFACT_BYTES)
    }

    #[must_use]
    pub fn with_limit(max_artifact_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            max_artifact_bytes,
        }
    }

    #[must_use]
    pub const fn max_artifact_bytes(&self) -> usize {
        self.max_artifact_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the sizes of all stored artifacts.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.lock().files.values().map(|f| f.bytes.len()).sum()
    }

    /// Returns a copy of the entry at `path`, including its modification time.
    #[must_use]
    pub fn stat(&self, path: &str) -> Option<VirtualFile> {
        let key = normalize_path(path);
        self.entries.lock().files.get(&key).cloned()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.files.clear();
        entries.order.clear();
    }

    /// Locates the finished article among the stored artifacts.
    ///
    /// A polished article wins over the plain draft; within one candidate name
    /// the earliest written path wins.
    #[must_use]
    pub fn find_article(&self) -> Option<VirtualFile> {
        let entries = self.entries.lock();
        ARTICLE_CANDIDATES.iter().find_map(|name| {
            entries
                .order
                .iter()
                .find(|path| path.rsplit('/').next() == Some(*name))
                .and_then(|path| entries.files.get(path))
                .cloned()
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore for MemoryStore {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let key = normalize_path(path);
        if key.is_empty() || key == "/" {
            return Err(Error::InvalidPath {
                path: path.to_string(),
            });
        }

        if bytes.len() > self.max_artifact_bytes {
            return Err(Error::StoreCapacityExceeded {
                path: key,
                size: bytes.len(),
                limit: self.max_artifact_bytes,
            });
        }

        let file = VirtualFile {
            path: key.clone(),
            bytes: Bytes::copy_from_slice(bytes),
            modified_at: Utc::now(),
        };

        let mut entries = self.entries.lock();
        if entries.files.insert(key.clone(), file).is_none() {
            entries.order.push(key);
        }
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Bytes> {
        let key = normalize_path(path);
        self.entries
            .lock()
            .files
            .get(&key)
            .map(|f| f.bytes.clone())
            .ok_or(Error::NotFound { path: key })
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        let mut prefix = normalize_path(prefix);
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        self.entries
            .lock()
            .order
            .iter()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn delete(&self, path: &str) {
        let key = normalize_path(path);
        let mut entries = self.entries.lock();
        if entries.files.remove(&key).is_some() {
            entries.order.retain(|p| p != &key);
        }
    }

    fn exists(&self, path: &str) -> bool {
        let key = normalize_path(path);
        self.entries.lock().files.contains_key(&key)
    }
}

/// Normalizes a logical path: backslashes become `/`, empty and `.` segments
/// are dropped, and a leading `/` is kept.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');
    let joined = path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");

    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}
