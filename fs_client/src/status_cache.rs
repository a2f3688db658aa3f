use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;

use blockfs_lib::{BfsError, BfsResult, FileStatus, StorePath};

struct StatusEntry {
    status: FileStatus,
    inserted_at: Instant,
}

/// In-memory path metadata cache with passive TTL expiry.
///
/// A hit requires presence, a clean entry and an unexpired clock. Dirty or
/// expired entries stay in the map and simply miss; replacement happens on
/// the next `put` (TTL clock restarts) or through `invalidate`.
pub struct MetadataStatusCache {
    ttl: Option<Duration>,
    entries: Mutex<HashMap<StorePath, StatusEntry>>,
}

impl MetadataStatusCache {
    /// `ttl: None` disables time-based expiry, entries then only leave
    /// through `invalidate`/`clear`.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock_entries(&self) -> BfsResult<std::sync::MutexGuard<'_, HashMap<StorePath, StatusEntry>>> {
        self.entries
            .lock()
            .map_err(|_| BfsError::InvalidState("status cache lock poisoned".to_string()))
    }

    pub fn get(&self, path: &StorePath) -> BfsResult<Option<FileStatus>> {
        let entries = self.lock_entries()?;
        let entry = match entries.get(path) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if entry.status.is_dirty() {
            debug!("status cache: dirty entry for {}, treated as miss", path);
            return Ok(None);
        }
        if let Some(ttl) = self.ttl {
            if entry.inserted_at.elapsed() > ttl {
                debug!("status cache: entry for {} expired", path);
                return Ok(None);
            }
        }
        Ok(Some(entry.status.clone()))
    }

    pub fn put(&self, path: StorePath, status: FileStatus) -> BfsResult<()> {
        let mut entries = self.lock_entries()?;
        entries.insert(
            path,
            StatusEntry {
                status,
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn invalidate(&self, path: &StorePath) -> BfsResult<()> {
        let mut entries = self.lock_entries()?;
        if entries.remove(path).is_some() {
            debug!("status cache: invalidated {}", path);
        }
        Ok(())
    }

    /// Drops the entry for `path` and every entry beneath it. Removing or
    /// renaming a directory stales the whole subtree at once.
    pub fn invalidate_subtree(&self, path: &StorePath) -> BfsResult<()> {
        let mut entries = self.lock_entries()?;
        let before = entries.len();
        if path.is_root() {
            entries.clear();
        } else {
            let prefix = format!("{}/", path.as_str());
            entries.retain(|p, _| p != path && !p.as_str().starts_with(&prefix));
        }
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!("status cache: invalidated {} entries under {}", dropped, path);
        }
        Ok(())
    }

    pub fn clear(&self) -> BfsResult<()> {
        let mut entries = self.lock_entries()?;
        entries.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockfs_lib::StatusInfo;

    fn sample_status(path: &StorePath) -> FileStatus {
        FileStatus::new(path.clone(), &StatusInfo::new_file(100, 4096))
    }

    #[test]
    fn test_ttl_hit_then_miss() {
        let cache = MetadataStatusCache::new(Some(Duration::from_millis(80)));
        let path = StorePath::new("/a/b");
        cache.put(path.clone(), sample_status(&path)).unwrap();

        let hit = cache.get(&path).unwrap();
        assert!(hit.is_some());

        std::thread::sleep(Duration::from_millis(120));
        assert!(cache.get(&path).unwrap().is_none());
        // expired entries are not swept, only bypassed
        assert_eq!(cache.len(), 1);

        // a fresh put restarts the clock
        cache.put(path.clone(), sample_status(&path)).unwrap();
        assert!(cache.get(&path).unwrap().is_some());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let cache = MetadataStatusCache::new(None);
        let path = StorePath::new("/a");
        cache.put(path.clone(), sample_status(&path)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&path).unwrap().is_some());
    }

    #[test]
    fn test_dirty_entry_misses_before_ttl() {
        let cache = MetadataStatusCache::new(Some(Duration::from_secs(3600)));
        let path = StorePath::new("/a");
        let status = sample_status(&path);
        cache.put(path.clone(), status.clone()).unwrap();
        assert!(cache.get(&path).unwrap().is_some());

        status.set_dirty();
        assert!(cache.get(&path).unwrap().is_none());
        // still present, removal is the caller's business
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = MetadataStatusCache::new(None);
        let a = StorePath::new("/a");
        let b = StorePath::new("/b");
        cache.put(a.clone(), sample_status(&a)).unwrap();
        cache.put(b.clone(), sample_status(&b)).unwrap();

        cache.invalidate(&a).unwrap();
        assert!(cache.get(&a).unwrap().is_none());
        assert!(cache.get(&b).unwrap().is_some());

        cache.clear().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_subtree() {
        let cache = MetadataStatusCache::new(None);
        for p in ["/data", "/data/a.bin", "/data/sub/b.bin", "/database", "/other"] {
            let path = StorePath::new(p);
            cache.put(path.clone(), sample_status(&path)).unwrap();
        }

        cache.invalidate_subtree(&StorePath::new("/data")).unwrap();
        assert!(cache.get(&StorePath::new("/data")).unwrap().is_none());
        assert!(cache.get(&StorePath::new("/data/a.bin")).unwrap().is_none());
        assert!(cache.get(&StorePath::new("/data/sub/b.bin")).unwrap().is_none());
        // name-prefix neighbours survive
        assert!(cache.get(&StorePath::new("/database")).unwrap().is_some());
        assert!(cache.get(&StorePath::new("/other")).unwrap().is_some());
    }
}
