use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};

use blockfs_lib::{
    make_store_client, BfsError, BfsResult, FileStatus, NodeKind, OpenMode, RemoteStoreClient,
    StatusInfo, StorePath,
};

use crate::config::ClientConfig;
use crate::file::{FileReader, FileWriter};
use crate::handle::{FileHandle, HandleOptions};
use crate::status_cache::MetadataStatusCache;

/// Decides whether a co-located block cache directory exists for a store
/// path. Deployments differ in how cache directories are laid out, the
/// facade only asks this one question per open.
pub trait BlockCacheLocator: Send + Sync {
    fn cache_dir(&self, path: &StorePath) -> Option<PathBuf>;
}

/// No co-location. Every block read goes to the store.
pub struct NoLocalCache;

impl BlockCacheLocator for NoLocalCache {
    fn cache_dir(&self, _path: &StorePath) -> Option<PathBuf> {
        None
    }
}

/// Mirrors the store tree under one local root: blocks of `/a/b.txt` live
/// in `<root>/a/b.txt/`. Paths without a cache directory on disk report no
/// co-location, so partially populated roots are fine.
pub struct FixedCacheRoot {
    root: PathBuf,
}

impl FixedCacheRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlockCacheLocator for FixedCacheRoot {
    fn cache_dir(&self, path: &StorePath) -> Option<PathBuf> {
        let mut dir = self.root.clone();
        for component in path.components() {
            dir.push(component);
        }
        if dir.is_dir() {
            Some(dir)
        } else {
            None
        }
    }
}

/// Client-side entry point to a block store.
///
/// Owns the store client, the path status cache and the registry of open
/// streams. All opens go through here so that `shutdown` can find and close
/// whatever is still running.
pub struct BlockFs {
    client: Arc<dyn RemoteStoreClient>,
    config: ClientConfig,
    status_cache: MetadataStatusCache,
    locator: Arc<dyn BlockCacheLocator>,
    streams: Mutex<HashMap<u64, Weak<FileHandle>>>,
    next_stream_id: AtomicU64,
}

impl BlockFs {
    pub fn new(client: Arc<dyn RemoteStoreClient>, config: ClientConfig) -> BfsResult<Self> {
        config.check()?;
        let status_cache = MetadataStatusCache::new(config.status_ttl());
        let locator: Arc<dyn BlockCacheLocator> = match &config.local_cache_root {
            Some(root) => Arc::new(FixedCacheRoot::new(root.clone())),
            None => Arc::new(NoLocalCache),
        };
        Ok(Self {
            client,
            config,
            status_cache,
            locator,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
        })
    }

    /// Builds the store client from the config's backend tag.
    pub fn from_config(config: ClientConfig) -> BfsResult<Self> {
        config.check()?;
        let client = make_store_client(config.store_backend, config.block_size);
        Self::new(client, config)
    }

    /// Replaces the locator picked from the config.
    pub fn with_locator(mut self, locator: Arc<dyn BlockCacheLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn lock_streams(&self) -> BfsResult<MutexGuard<'_, HashMap<u64, Weak<FileHandle>>>> {
        self.streams
            .lock()
            .map_err(|_| BfsError::InvalidState("stream registry lock poisoned".to_string()))
    }

    fn register(&self, handle: FileHandle) -> BfsResult<Arc<FileHandle>> {
        let handle = Arc::new(handle);
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let mut streams = self.lock_streams()?;
        streams.retain(|_, weak| weak.strong_count() > 0);
        streams.insert(id, Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Open streams still referenced by someone.
    pub fn open_stream_count(&self) -> BfsResult<usize> {
        let mut streams = self.lock_streams()?;
        streams.retain(|_, weak| weak.strong_count() > 0);
        Ok(streams.len())
    }

    fn handle_options(&self, path: &StorePath) -> HandleOptions {
        HandleOptions {
            keepalive_interval: self.config.keepalive_interval(),
            local_read_fail_limit: self.config.local_read_fail_limit,
            local_cache_dir: self.locator.cache_dir(path),
        }
    }

    /// Path status, served from the cache when a clean unexpired entry
    /// exists. A missing path is an error and is never cached.
    pub async fn get_status(&self, path: &StorePath) -> BfsResult<FileStatus> {
        if let Some(status) = self.status_cache.get(path)? {
            return Ok(status);
        }
        let info = self
            .client
            .stat(path)
            .await?
            .ok_or_else(|| BfsError::NotFound(path.to_string()))?;
        let status = FileStatus::new(path.clone(), &info);
        self.status_cache.put(path.clone(), status.clone())?;
        debug!("fetched status of {} from the store", path);
        Ok(status)
    }

    pub async fn exists(&self, path: &StorePath) -> BfsResult<bool> {
        match self.get_status(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Opens an existing file for reading.
    pub async fn open_for_read(&self, path: &StorePath) -> BfsResult<FileReader> {
        let status = self.get_status(path).await?;
        if !status.is_file() {
            return Err(BfsError::NotFile(path.to_string()));
        }
        let handle = FileHandle::open(
            self.client.clone(),
            status,
            OpenMode::Read,
            self.handle_options(path),
        )
        .await?;
        let handle = self.register(handle)?;
        Ok(FileReader::new(handle, self.config.block_buffer_count))
    }

    /// Opens a file for writing, creating it when missing.
    ///
    /// An existing file is rejected unless `overwrite` is set, in which
    /// case it is truncated to zero first. Directories are never writable.
    pub async fn open_for_write(&self, path: &StorePath, overwrite: bool) -> BfsResult<FileWriter> {
        if path.is_root() {
            return Err(BfsError::InvalidParam(
                "cannot open the root for writing".to_string(),
            ));
        }
        // open decisions need the store's truth, not a cached one
        let existing = self.client.stat(path).await?;
        match &existing {
            Some(info) if info.kind == NodeKind::Dir => {
                return Err(BfsError::NotFile(path.to_string()));
            }
            Some(_) if !overwrite => {
                return Err(BfsError::AlreadyExists(path.to_string()));
            }
            _ => {}
        }
        let block_size = existing
            .as_ref()
            .map(|info| info.block_size)
            .filter(|b| *b > 0)
            .unwrap_or(self.config.block_size);
        let status = FileStatus::new(path.clone(), &StatusInfo::new_file(0, block_size));
        let handle = FileHandle::open(
            self.client.clone(),
            status.clone(),
            OpenMode::Write,
            self.handle_options(path),
        )
        .await?;
        if existing.is_some() {
            if let Err(e) = handle.truncate(0).await {
                let _ = handle.close().await;
                self.status_cache.invalidate(path)?;
                return Err(e);
            }
        }
        // the cached entry shares state with the handle, so size changes
        // show up on later lookups and the close-time dirty mark turns the
        // entry into a miss
        self.status_cache.put(path.clone(), status)?;
        let handle = self.register(handle)?;
        Ok(FileWriter::new(handle, self.config.block_buffer_count))
    }

    pub async fn mkdir(&self, path: &StorePath) -> BfsResult<()> {
        self.client.mkdir(path).await?;
        self.status_cache.invalidate(path)?;
        Ok(())
    }

    pub async fn remove(&self, path: &StorePath) -> BfsResult<()> {
        self.client.remove(path).await?;
        self.status_cache.invalidate_subtree(path)?;
        Ok(())
    }

    pub async fn rename(&self, from: &StorePath, to: &StorePath) -> BfsResult<()> {
        self.client.rename(from, to).await?;
        self.status_cache.invalidate_subtree(from)?;
        self.status_cache.invalidate_subtree(to)?;
        Ok(())
    }

    pub async fn list_directory(&self, path: &StorePath) -> BfsResult<Vec<String>> {
        self.client.list_directory(path).await
    }

    pub async fn get_xattr(&self, path: &StorePath, name: &str) -> BfsResult<Vec<u8>> {
        self.client.get_xattr(path, name).await
    }

    /// Closes every open stream best effort, drops the status cache and
    /// disconnects from the store. Streams that fail to close are logged
    /// and skipped, the shutdown keeps going.
    pub async fn shutdown(&self) -> BfsResult<()> {
        let live: Vec<Arc<FileHandle>> = {
            let mut streams = self.lock_streams()?;
            let live = streams.values().filter_map(Weak::upgrade).collect();
            streams.clear();
            live
        };
        info!("shutting down, {} streams still open", live.len());
        let results = futures::future::join_all(live.iter().map(|handle| handle.close())).await;
        for (handle, result) in live.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    "closing {} during shutdown failed: {}",
                    handle.status().path(),
                    e
                );
            }
        }
        self.status_cache.clear()?;
        self.client.disconnect().await?;
        Ok(())
    }
}
