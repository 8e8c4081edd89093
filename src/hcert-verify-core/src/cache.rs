//! Trust resource cache.
//!
//! Parsed snapshots live in memory; the raw gateway bytes are optionally
//! persisted as one file per resource (`<cache_dir>/<resource>.cache`).
//! A persisted file's modification time is its fetched-at clock when it is
//! loaded on cold start. Storage failures never fail verification: they are
//! logged and the cache degrades to memory only.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::VerifyError;
use crate::trust::TrustStoreSnapshot;

/// Extension of persisted resource files.
pub const CACHE_FILE_EXTENSION: &str = "cache";

/// Cache of trust snapshots keyed by resource name.
pub struct ResourceCache {
    /// In-memory snapshots.
    memory: RwLock<HashMap<String, Arc<TrustStoreSnapshot>>>,
    /// Storage backend (optional).
    storage: Option<StorageBackend>,
}

/// Raw bytes read back from storage.
#[derive(Debug, Clone)]
pub struct PersistedResource {
    /// Body as fetched from the gateway.
    pub bytes: Vec<u8>,
    /// File modification time.
    pub fetched_at: DateTime<Utc>,
}

/// Storage backend for persisted resources.
struct StorageBackend {
    /// Path to cache directory.
    cache_dir: PathBuf,
}

impl StorageBackend {
    fn entry_path(&self, resource: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", resource, CACHE_FILE_EXTENSION))
    }
}

impl ResourceCache {
    /// Create a cache, persisting to `cache_dir` when given.
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            storage: cache_dir.map(|dir| StorageBackend { cache_dir: dir }),
        }
    }

    /// Memory-only cache.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Directory used for persistence, if any.
    #[must_use]
    pub fn cache_dir(&self) -> Option<&Path> {
        self.storage.as_ref().map(|s| s.cache_dir.as_path())
    }

    /// Snapshot held in memory for `resource`, regardless of age.
    pub fn get(&self, resource: &str) -> Option<Arc<TrustStoreSnapshot>> {
        self.memory
            .read()
            .ok()
            .and_then(|cache| cache.get(resource).cloned())
    }

    /// Store a snapshot in memory only.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the memory lock is poisoned.
    pub fn insert(&self, snapshot: Arc<TrustStoreSnapshot>) -> Result<(), VerifyError> {
        let mut cache = self.memory.write().map_err(|_| VerifyError::CacheError {
            message: "Failed to acquire cache lock".into(),
        })?;
        cache.insert(snapshot.resource().to_string(), snapshot);
        Ok(())
    }

    /// Store a freshly fetched snapshot and persist its raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the memory lock is poisoned. Persistence
    /// failures are only logged.
    pub fn put(&self, snapshot: Arc<TrustStoreSnapshot>, raw: &[u8]) -> Result<(), VerifyError> {
        let resource = snapshot.resource().to_string();
        self.insert(snapshot)?;
        self.put_to_storage(&resource, raw);
        Ok(())
    }

    /// Read persisted bytes for `resource`.
    pub fn load_persisted(&self, resource: &str) -> Option<PersistedResource> {
        let storage = self.storage.as_ref()?;
        let path = storage.entry_path(resource);

        let bytes = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                debug!("Cache: no persisted '{}' ({})", resource, e);
                return None;
            },
        };
        let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!("Cache: no modification time for '{}': {}", path.display(), e);
                return None;
            },
        };

        let fetched_at = DateTime::<Utc>::from(modified);
        debug!(
            resource,
            bytes = bytes.len(),
            %fetched_at,
            "Cache: loaded persisted resource"
        );
        Some(PersistedResource { bytes, fetched_at })
    }

    /// Drop a resource from memory and storage.
    pub fn invalidate(&self, resource: &str) {
        if let Ok(mut cache) = self.memory.write() {
            cache.remove(resource);
        }

        if let Some(ref storage) = self.storage {
            let _ = std::fs::remove_file(storage.entry_path(resource));
        }
    }

    /// Write `raw` to `<resource>.cache` through a temp file and rename, so
    /// readers never observe a partial body.
    fn put_to_storage(&self, resource: &str, raw: &[u8]) {
        let storage = match &self.storage {
            Some(s) => s,
            None => return,
        };

        if let Err(e) = std::fs::create_dir_all(&storage.cache_dir) {
            warn!("Cache: failed to create cache directory: {}", e);
            return;
        }

        let path = storage.entry_path(resource);
        let tmp = storage
            .cache_dir
            .join(format!(".{}.{}.tmp", resource, std::process::id()));

        let written = std::fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(raw)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| std::fs::rename(&tmp, &path)) {
            warn!("Cache: failed to persist '{}': {}", path.display(), e);
            let _ = std::fs::remove_file(&tmp);
            return;
        }

        debug!(resource, bytes = raw.len(), "Cache: persisted resource");
    }
}
