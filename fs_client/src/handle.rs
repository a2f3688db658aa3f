use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use blockfs_lib::{
    block_start, BfsError, BfsResult, Descriptor, FileStatus, OpenMode, RemoteStoreClient,
};

use crate::config::{DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_LOCAL_READ_FAIL_LIMIT};
use crate::local_cache::LocalBlockCacheIndex;
use crate::read_buffer::{BlockBuffer, BlockSourceKind};
use crate::write_buffer::WriteBuffer;

/// Per-handle knobs the facade derives from its config.
#[derive(Debug, Clone)]
pub struct HandleOptions {
    pub keepalive_interval: Duration,
    pub local_read_fail_limit: u32,
    /// Directory holding co-located block files for this file, if any.
    /// Only consulted for read handles, a write handle truncates the file
    /// so any cached block would be stale.
    pub local_cache_dir: Option<PathBuf>,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
            local_read_fail_limit: DEFAULT_LOCAL_READ_FAIL_LIMIT,
            local_cache_dir: None,
        }
    }
}

struct HandleInner {
    closed: bool,
    modified: bool,
    write: Option<WriteBuffer>,
    local_index: Option<LocalBlockCacheIndex>,
    local_failures: u32,
    local_disabled: bool,
    keepalive: Option<JoinHandle<()>>,
}

/// One open descriptor on the store.
///
/// Owns the write accumulation window, the local block index snapshot and
/// the lease renewal task. Data path operations serialize on the inner
/// lock, streams layered on top may share a handle through an `Arc`.
pub struct FileHandle {
    client: Arc<dyn RemoteStoreClient>,
    status: FileStatus,
    descriptor: Descriptor,
    readonly: bool,
    block_size: u64,
    local_read_fail_limit: u32,
    inner: Mutex<HandleInner>,
}

impl FileHandle {
    /// Opens a descriptor on the store and starts its lease renewal task.
    ///
    /// The local index is scanned once, at open. Block files written to the
    /// cache directory afterwards are not picked up by this handle.
    pub async fn open(
        client: Arc<dyn RemoteStoreClient>,
        status: FileStatus,
        mode: OpenMode,
        opts: HandleOptions,
    ) -> BfsResult<Self> {
        if !status.is_file() {
            return Err(BfsError::NotFile(status.path().to_string()));
        }
        let block_size = status.block_size();
        if block_size == 0 {
            return Err(BfsError::InvalidData(format!(
                "status for {} has zero block size",
                status.path()
            )));
        }

        let descriptor = client.open(status.path(), mode).await?;
        let readonly = mode == OpenMode::Read;

        let local_index = match (&opts.local_cache_dir, readonly) {
            (Some(dir), true) => {
                let index = LocalBlockCacheIndex::build(dir.clone()).await;
                debug!(
                    "local block index for {}: {} entries under {}",
                    status.path(),
                    index.len(),
                    dir.display()
                );
                Some(index)
            }
            _ => None,
        };

        let keepalive =
            Self::spawn_keepalive(client.clone(), descriptor, opts.keepalive_interval);

        debug!(
            "opened {} as descriptor {} ({:?})",
            status.path(),
            descriptor,
            mode
        );

        Ok(Self {
            client,
            status,
            descriptor,
            readonly,
            block_size,
            local_read_fail_limit: opts.local_read_fail_limit,
            inner: Mutex::new(HandleInner {
                closed: false,
                modified: false,
                write: (!readonly).then(|| WriteBuffer::new(block_size)),
                local_index,
                local_failures: 0,
                local_disabled: false,
                keepalive: Some(keepalive),
            }),
        })
    }

    fn spawn_keepalive(
        client: Arc<dyn RemoteStoreClient>,
        descriptor: Descriptor,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // renewal failures never surface, the next tick retries
                if let Err(e) = client.extend_lease(descriptor).await {
                    debug!("lease renewal for descriptor {} failed: {}", descriptor, e);
                }
            }
        })
    }

    pub fn status(&self) -> &FileStatus {
        &self.status
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn is_modified(&self) -> bool {
        self.inner.lock().await.modified
    }

    fn check_open(inner: &HandleInner, status: &FileStatus) -> BfsResult<()> {
        if inner.closed {
            return Err(BfsError::InvalidState(format!(
                "handle on {} is closed",
                status.path()
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> BfsResult<()> {
        if self.readonly {
            return Err(BfsError::PermissionDenied(format!(
                "handle on {} is read-only",
                self.status.path()
            )));
        }
        Ok(())
    }

    /// Fetches one block for reading.
    ///
    /// Source selection runs once per call: the unflushed write window is
    /// served from memory, then the local index, then the store. A local
    /// open failure counts against the fail limit and falls through to the
    /// store, so readers never see the local path as an error.
    pub async fn fetch_block(&self, block_id: u64) -> BfsResult<BlockBuffer> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        Self::check_open(inner, &self.status)?;
        let start = block_start(block_id, self.block_size);

        if let Some(buffer) = Self::overlay_block(inner, block_id, self.block_size) {
            debug!(
                "serving block {} of {} from the write window ({} bytes)",
                block_id,
                self.status.path(),
                buffer.loaded_len()
            );
            return Ok(buffer);
        }

        if !inner.local_disabled {
            if let Some(index) = inner.local_index.as_ref() {
                match index.open_block(block_id, self.block_size).await {
                    Ok(Some(source)) => {
                        inner.local_failures = 0;
                        return Ok(BlockBuffer::new(
                            block_id,
                            start,
                            self.block_size,
                            source,
                            BlockSourceKind::Local,
                        ));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(
                            "local block {} of {} unavailable: {}",
                            block_id,
                            self.status.path(),
                            e
                        );
                        Self::note_local_failure(inner, &self.status, self.local_read_fail_limit);
                    }
                }
            }
        }
        drop(guard);

        self.fetch_block_remote(block_id).await
    }

    fn overlay_block(inner: &HandleInner, block_id: u64, block_size: u64) -> Option<BlockBuffer> {
        let write = inner.write.as_ref()?;
        let (span_start, bytes) = write.buffered_span()?;
        let start = block_start(block_id, block_size);
        if span_start != start {
            return None;
        }
        Some(BlockBuffer::from_bytes(
            block_id,
            start,
            block_size,
            bytes.to_vec(),
        ))
    }

    /// Snapshot of the write window when it currently holds this block's
    /// bytes. Readers sharing the handle consult this before trusting a
    /// previously cached copy of the block.
    pub async fn write_overlay_block(&self, block_id: u64) -> BfsResult<Option<BlockBuffer>> {
        let guard = self.inner.lock().await;
        Self::check_open(&guard, &self.status)?;
        Ok(Self::overlay_block(&guard, block_id, self.block_size))
    }

    /// Fetches one block from the store, bypassing the local index. Used
    /// when a local source failed mid read and the block must be refetched.
    pub async fn fetch_block_remote(&self, block_id: u64) -> BfsResult<BlockBuffer> {
        {
            let guard = self.inner.lock().await;
            Self::check_open(&guard, &self.status)?;
        }
        let start = block_start(block_id, self.block_size);
        let source = self
            .client
            .read_block(self.descriptor, start, self.block_size)
            .await?;
        Ok(BlockBuffer::new(
            block_id,
            start,
            self.block_size,
            source,
            BlockSourceKind::Remote,
        ))
    }

    /// Records a mid-read failure of a local block source.
    pub async fn record_local_failure(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        Self::note_local_failure(inner, &self.status, self.local_read_fail_limit);
    }

    fn note_local_failure(inner: &mut HandleInner, status: &FileStatus, limit: u32) {
        inner.local_failures += 1;
        if !inner.local_disabled && inner.local_failures >= limit {
            inner.local_disabled = true;
            warn!(
                "local block cache for {} disabled after {} consecutive read failures",
                status.path(),
                inner.local_failures
            );
        }
    }

    /// Appends bytes at the write window position. Full blocks are sent to
    /// the store as they fill, a trailing partial block stays buffered
    /// until `flush` or `close`.
    pub async fn write(&self, data: &[u8]) -> BfsResult<()> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        Self::check_open(inner, &self.status)?;

        let mut rest = data;
        while !rest.is_empty() {
            let write = inner.write.as_mut().ok_or_else(|| {
                BfsError::InvalidState(format!(
                    "write buffer missing on handle for {}",
                    self.status.path()
                ))
            })?;
            let consumed = write.fill(rest);
            rest = &rest[consumed..];
            if write.is_full() {
                let (offset, payload) = write.full_payload();
                let end = offset + payload.len() as u64;
                self.client
                    .write_block(self.descriptor, offset, payload)
                    .await?;
                write.advance_block();
                inner.modified = true;
                self.status.notify_size_changed(end);
            }
        }
        Ok(())
    }

    /// Sends the unflushed part of the write window to the store.
    ///
    /// The window keeps accumulating after a partial flush, a later flush
    /// of the same block re-sends the whole buffered prefix at the block's
    /// start offset.
    pub async fn flush(&self) -> BfsResult<()> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        Self::check_open(inner, &self.status)?;
        Self::flush_locked(&self.client, self.descriptor, &self.status, inner).await
    }

    async fn flush_locked(
        client: &Arc<dyn RemoteStoreClient>,
        descriptor: Descriptor,
        status: &FileStatus,
        inner: &mut HandleInner,
    ) -> BfsResult<()> {
        let write = match inner.write.as_mut() {
            Some(write) => write,
            None => return Ok(()),
        };
        let (offset, payload) = match write.flush_payload() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        let end = offset + payload.len() as u64;
        client.write_block(descriptor, offset, payload).await?;
        write.mark_flushed();
        inner.modified = true;
        status.notify_size_changed(end);
        Ok(())
    }

    /// Truncates the file on the store and pins the cached size to the new
    /// length, shrink included.
    pub async fn truncate(&self, offset: u64) -> BfsResult<()> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        Self::check_open(inner, &self.status)?;
        self.client.truncate(self.descriptor, offset).await?;
        self.status.force_size(offset);
        inner.modified = true;
        Ok(())
    }

    /// Closes the handle. Idempotent, a second call returns `Ok` without
    /// touching the store.
    ///
    /// Order matters: stop the lease task first so no renewal races the
    /// store close, then close the descriptor, then mark the status dirty
    /// when the file was modified. The dirty mark happens even if the
    /// store close failed, the file content did change.
    pub async fn close(&self) -> BfsResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        if let Some(task) = inner.keepalive.take() {
            task.abort();
            let _ = task.await;
        }

        if !self.readonly {
            if let Err(e) =
                Self::flush_locked(&self.client, self.descriptor, &self.status, inner).await
            {
                warn!(
                    "flush of pending bytes on close of {} failed: {}",
                    self.status.path(),
                    e
                );
            }
        }

        let close_result = self.client.close(self.descriptor).await;

        if inner.modified && !self.readonly {
            self.status.set_dirty();
        }
        inner.write = None;
        inner.local_index = None;

        match &close_result {
            Ok(()) => debug!(
                "closed descriptor {} for {}",
                self.descriptor,
                self.status.path()
            ),
            Err(e) => warn!(
                "store close for descriptor {} ({}) failed: {}",
                self.descriptor,
                self.status.path(),
                e
            ),
        }
        close_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockfs_lib::{MemStore, StatusInfo, StorePath};
    use tokio::time::sleep;

    const BLOCK: u64 = 8;

    async fn store_with_file(path: &str, content: &[u8]) -> Arc<MemStore> {
        let store = Arc::new(MemStore::new(BLOCK));
        let sp = StorePath::new(path);
        let fd = store.open(&sp, OpenMode::Write).await.unwrap();
        let mut offset = 0u64;
        for chunk in content.chunks(BLOCK as usize) {
            store.write_block(fd, offset, chunk).await.unwrap();
            offset += BLOCK;
        }
        store.close(fd).await.unwrap();
        store
    }

    fn file_status(path: &str, size: u64) -> FileStatus {
        FileStatus::new(StorePath::new(path), &StatusInfo::new_file(size, BLOCK))
    }

    fn short_keepalive() -> HandleOptions {
        HandleOptions {
            keepalive_interval: Duration::from_millis(20),
            ..HandleOptions::default()
        }
    }

    #[tokio::test]
    async fn test_keepalive_runs_until_close() {
        let store = store_with_file("/k.bin", b"abc").await;
        let client: Arc<dyn RemoteStoreClient> = store.clone();
        let handle = FileHandle::open(
            client,
            file_status("/k.bin", 3),
            OpenMode::Read,
            short_keepalive(),
        )
        .await
        .unwrap();

        sleep(Duration::from_millis(90)).await;
        assert!(store.counters().extend_lease_count() >= 2);

        handle.close().await.unwrap();
        let after_close = store.counters().extend_lease_count();
        sleep(Duration::from_millis(80)).await;
        assert_eq!(store.counters().extend_lease_count(), after_close);

        // second close is a no-op
        handle.close().await.unwrap();
        assert_eq!(store.counters().close_count(), 2);
    }

    #[tokio::test]
    async fn test_write_sends_full_blocks_and_buffers_tail() {
        let store = Arc::new(MemStore::new(BLOCK));
        let client: Arc<dyn RemoteStoreClient> = store.clone();
        let handle = FileHandle::open(
            client,
            file_status("/w.bin", 0),
            OpenMode::Write,
            HandleOptions::default(),
        )
        .await
        .unwrap();

        handle.write(&[7u8; 10]).await.unwrap();
        let log = store.write_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].block_offset, 0);
        assert_eq!(log[0].len, BLOCK as usize);
        assert_eq!(handle.status().size(), BLOCK);

        handle.flush().await.unwrap();
        let log = store.write_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].block_offset, BLOCK);
        assert_eq!(log[1].len, 2);
        assert_eq!(handle.status().size(), 10);

        // nothing new buffered, flush is a no-op
        handle.flush().await.unwrap();
        assert_eq!(store.write_log().len(), 2);

        handle.close().await.unwrap();
        assert!(handle.status().is_dirty());
    }

    #[tokio::test]
    async fn test_partial_flush_resends_whole_prefix() {
        let store = Arc::new(MemStore::new(BLOCK));
        let client: Arc<dyn RemoteStoreClient> = store.clone();
        let handle = FileHandle::open(
            client,
            file_status("/p.bin", 0),
            OpenMode::Write,
            HandleOptions::default(),
        )
        .await
        .unwrap();

        handle.write(&[1, 2, 3]).await.unwrap();
        handle.flush().await.unwrap();
        handle.write(&[4, 5]).await.unwrap();
        handle.flush().await.unwrap();

        let log = store.write_log();
        assert_eq!(log.len(), 2);
        assert_eq!((log[0].block_offset, log[0].len), (0, 3));
        assert_eq!((log[1].block_offset, log[1].len), (0, 5));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_readonly_handle_rejects_writes() {
        let store = store_with_file("/r.bin", b"abc").await;
        let client: Arc<dyn RemoteStoreClient> = store.clone();
        let handle = FileHandle::open(
            client,
            file_status("/r.bin", 3),
            OpenMode::Read,
            HandleOptions::default(),
        )
        .await
        .unwrap();

        let err = handle.write(&[1]).await.unwrap_err();
        assert!(err.is_permission_denied());
        let err = handle.truncate(0).await.unwrap_err();
        assert!(err.is_permission_denied());

        handle.close().await.unwrap();
        // never modified, so the status stays clean
        assert!(!handle.status().is_dirty());
    }

    #[tokio::test]
    async fn test_fetch_block_serves_write_window_without_store_read() {
        let store = Arc::new(MemStore::new(BLOCK));
        let client: Arc<dyn RemoteStoreClient> = store.clone();
        let handle = FileHandle::open(
            client,
            file_status("/o.bin", 0),
            OpenMode::Write,
            HandleOptions::default(),
        )
        .await
        .unwrap();

        handle.write(&[9, 8, 7]).await.unwrap();
        let mut buffer = handle.fetch_block(0).await.unwrap();
        assert_eq!(buffer.kind(), BlockSourceKind::WriteOverlay);
        assert!(buffer.is_complete());
        let mut dest = [0u8; 8];
        let n = buffer.read(0, &mut dest).await.unwrap();
        assert_eq!(&dest[..n], &[9, 8, 7]);
        assert_eq!(store.counters().read_block_count(), 0);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_failures_disable_local_path() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("0.1"), b"LOCAL---").unwrap();
        let store = store_with_file("/l.bin", b"remote--").await;
        let client: Arc<dyn RemoteStoreClient> = store.clone();
        let handle = FileHandle::open(
            client,
            file_status("/l.bin", 8),
            OpenMode::Read,
            HandleOptions {
                local_cache_dir: Some(dir.path().to_path_buf()),
                ..HandleOptions::default()
            },
        )
        .await
        .unwrap();

        let buffer = handle.fetch_block(0).await.unwrap();
        assert_eq!(buffer.kind(), BlockSourceKind::Local);

        for _ in 0..DEFAULT_LOCAL_READ_FAIL_LIMIT {
            handle.record_local_failure().await;
        }
        let mut buffer = handle.fetch_block(0).await.unwrap();
        assert_eq!(buffer.kind(), BlockSourceKind::Remote);
        let mut dest = [0u8; 8];
        let n = buffer.read(0, &mut dest).await.unwrap();
        assert_eq!(&dest[..n], b"remote--");
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_vanished_local_file_falls_back_to_store() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("0.1"), b"LOCAL---").unwrap();
        let store = store_with_file("/v.bin", b"remote--").await;
        let client: Arc<dyn RemoteStoreClient> = store.clone();
        let handle = FileHandle::open(
            client,
            file_status("/v.bin", 8),
            OpenMode::Read,
            HandleOptions {
                local_cache_dir: Some(dir.path().to_path_buf()),
                ..HandleOptions::default()
            },
        )
        .await
        .unwrap();

        // drop the cached file after the index snapshot was taken
        std::fs::remove_file(dir.path().join("0.1")).unwrap();
        let mut buffer = handle.fetch_block(0).await.unwrap();
        assert_eq!(buffer.kind(), BlockSourceKind::Remote);
        let mut dest = [0u8; 8];
        let n = buffer.read(0, &mut dest).await.unwrap();
        assert_eq!(&dest[..n], b"remote--");
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let store = store_with_file("/c.bin", b"abc").await;
        let client: Arc<dyn RemoteStoreClient> = store.clone();
        let handle = FileHandle::open(
            client,
            file_status("/c.bin", 3),
            OpenMode::Read,
            HandleOptions::default(),
        )
        .await
        .unwrap();
        handle.close().await.unwrap();
        assert!(handle.is_closed().await);
        assert!(handle.fetch_block(0).await.is_err());
    }
}
