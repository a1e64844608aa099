//! Local artifact cache.
//!
//! One file per `(manager, name, version)` key. The coordinator checks here
//! before touching any network source, and a maintenance sweep removes
//! entries past a configurable age.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::error::DepotResult;
use crate::types::PackageKey;

/// Snapshot of cache usage for external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cached_packages: usize,
    pub cache_size_bytes: u64,
}

#[derive(Debug)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    pub fn new(root: &Path) -> DepotResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Canonical artifact path for a key. Path separators in key components
    /// are flattened so a key can never escape the cache root.
    pub fn path_for(&self, key: &PackageKey) -> PathBuf {
        let file = format!("{}_{}_{}.pkg", key.manager, key.name, key.version)
            .replace(['/', '\\'], "_");
        self.root.join(file)
    }

    /// Returns the artifact path on a cache hit.
    pub fn lookup(&self, key: &PackageKey) -> Option<PathBuf> {
        let path = self.path_for(key);
        path.is_file().then_some(path)
    }

    /// Store artifact bytes, returning the cached path.
    pub fn store_bytes(&self, key: &PackageKey, bytes: &[u8]) -> DepotResult<PathBuf> {
        let path = self.path_for(key);
        // Write through a temp name so a concurrent lookup never sees a
        // half-written artifact.
        let tmp = path.with_extension("pkg.partial");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        debug!(key = %key, bytes = bytes.len(), "cached artifact");
        Ok(path)
    }

    /// Delete cached artifacts older than `max_age_days`, returning how many
    /// were removed.
    pub fn cleanup_older_than(&self, max_age_days: u64) -> DepotResult<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(max_age_days * 24 * 3600);
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "pkg") {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified < cutoff {
                fs::remove_file(&path)?;
                removed += 1;
                info!(path = %path.display(), "removed stale cache entry");
            }
        }
        Ok(removed)
    }

    pub fn stats(&self) -> DepotResult<CacheStats> {
        let mut cached_packages = 0;
        let mut cache_size_bytes = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().extension().map_or(false, |ext| ext == "pkg") {
                cached_packages += 1;
                cache_size_bytes += entry.metadata()?.len();
            }
        }
        Ok(CacheStats {
            cached_packages,
            cache_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_then_lookup_roundtrip() {
        let dir = tempdir().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let key = PackageKey::new("apt", "curl", "8.5.0");

        assert!(cache.lookup(&key).is_none());
        let path = cache.store_bytes(&key, b"artifact-bytes").unwrap();
        assert_eq!(cache.lookup(&key), Some(path.clone()));
        assert_eq!(fs::read(path).unwrap(), b"artifact-bytes");
    }

    #[test]
    fn keys_cannot_escape_the_cache_root() {
        let dir = tempdir().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let key = PackageKey::new("apt", "../../etc/passwd", "1");
        let path = cache.path_for(&key);
        assert!(path.starts_with(dir.path()));
    }

    #[test]
    fn cleanup_removes_only_old_entries() {
        let dir = tempdir().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let key = PackageKey::new("apt", "curl", "8.5.0");
        cache.store_bytes(&key, b"fresh").unwrap();

        // Nothing is older than 7 days.
        assert_eq!(cache.cleanup_older_than(7).unwrap(), 0);
        // Everything is older than "0 days ago" going forward.
        assert_eq!(cache.cleanup_older_than(0).unwrap(), 1);
        assert!(cache.lookup(&key).is_none());
    }

    #[test]
    fn stats_count_artifacts_only() {
        let dir = tempdir().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        cache
            .store_bytes(&PackageKey::new("apt", "curl", "1"), b"12345")
            .unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.cached_packages, 1);
        assert_eq!(stats.cache_size_bytes, 5);
    }
}
