use std::fmt;
use std::sync::Arc;

use log::debug;

use blockfs_lib::{block_id, block_len, in_block_offset, BfsError, BfsResult, FileStatus};

use crate::handle::FileHandle;
use crate::read_buffer::{BlockBufferCache, BlockSourceKind};

/// Sequential reader over a file handle.
///
/// Keeps a small pool of block buffers so short application reads do not
/// turn into one store round trip each. A reader created through
/// [`FileWriter::reader`] shares the writer's handle and leaves closing it
/// to the writer.
pub struct FileReader {
    handle: Arc<FileHandle>,
    position: u64,
    buffers: BlockBufferCache,
    close_handle: bool,
}

impl FileReader {
    /// Reader that owns its handle and closes it on `close`.
    pub fn new(handle: Arc<FileHandle>, buffer_count: usize) -> Self {
        Self {
            handle,
            position: 0,
            buffers: BlockBufferCache::new(buffer_count),
            close_handle: true,
        }
    }

    /// Reader over a handle someone else closes.
    pub fn shared(handle: Arc<FileHandle>, buffer_count: usize) -> Self {
        Self {
            handle,
            position: 0,
            buffers: BlockBufferCache::new(buffer_count),
            close_handle: false,
        }
    }

    pub fn status(&self) -> &FileStatus {
        self.handle.status()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    /// Reads at the current position into `dest` and advances.
    ///
    /// Returns at most one block's worth of bytes per call, a short count
    /// at a block boundary is not an error. Zero means end of file.
    pub async fn read(&mut self, dest: &mut [u8]) -> BfsResult<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        let block_size = self.handle.block_size();
        let id = block_id(self.position, block_size);
        let in_block = in_block_offset(self.position, block_size) as usize;
        let n = self.read_in_block(id, in_block, dest).await?;
        self.position += n as u64;
        Ok(n)
    }

    /// Reads from the current position to end of file.
    pub async fn read_to_end(&mut self) -> BfsResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; self.handle.block_size() as usize];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_in_block(
        &mut self,
        id: u64,
        in_block: usize,
        dest: &mut [u8],
    ) -> BfsResult<usize> {
        // bytes sitting in the shared handle's write window supersede any
        // copy this reader cached earlier
        if let Some(mut overlay) = self.handle.write_overlay_block(id).await? {
            if let Some(mut stale) = self.buffers.remove(id) {
                stale.close();
            }
            return overlay.read(in_block, dest).await;
        }
        if !self.buffers.contains(id) {
            let buffer = self.handle.fetch_block(id).await?;
            if buffer.kind() == BlockSourceKind::WriteOverlay {
                // the write window may grow under us, serve it and forget it
                let mut buffer = buffer;
                return buffer.read(in_block, dest).await;
            }
            self.buffers.insert(buffer);
        }
        let block_size = self.handle.block_size();
        let expected = block_len(self.handle.status().size(), block_size, id) as usize;
        let buffer = self.buffers.get_mut(id).ok_or_else(|| {
            BfsError::InvalidState(format!("block buffer {} missing after insert", id))
        })?;

        let kind = buffer.kind();
        let result = buffer.read(in_block, dest).await;
        let ran_short =
            result.is_ok() && buffer.is_complete() && buffer.loaded_len() < expected;
        let local_failed = kind == BlockSourceKind::Local && (result.is_err() || ran_short);
        // a cached remote block falls behind when a flush lands in its range
        // after the buffer completed
        let remote_stale = kind == BlockSourceKind::Remote && ran_short;
        if local_failed || remote_stale {
            if let Err(e) = &result {
                debug!("local read of block {} failed: {}", id, e);
            } else {
                debug!(
                    "cached block {} is short: {} of {} bytes, refetching",
                    id,
                    buffer.loaded_len(),
                    expected
                );
            }
            if local_failed {
                self.handle.record_local_failure().await;
            }
            if let Some(mut stale) = self.buffers.remove(id) {
                stale.close();
            }
            let fresh = self.handle.fetch_block_remote(id).await?;
            self.buffers.insert(fresh);
            let buffer = self.buffers.get_mut(id).ok_or_else(|| {
                BfsError::InvalidState(format!("block buffer {} missing after refetch", id))
            })?;
            return buffer.read(in_block, dest).await;
        }
        result
    }

    /// Releases buffered blocks, and the handle when this reader owns it.
    pub async fn close(&mut self) -> BfsResult<()> {
        self.buffers.close_all();
        if self.close_handle {
            self.handle.close().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for FileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReader")
            .field("path", self.handle.status().path())
            .field("position", &self.position)
            .field("buffered_blocks", &self.buffers.len())
            .field("close_handle", &self.close_handle)
            .finish()
    }
}

/// Sequential writer over a file handle.
pub struct FileWriter {
    handle: Arc<FileHandle>,
    buffer_count: usize,
    written: u64,
}

impl FileWriter {
    pub fn new(handle: Arc<FileHandle>, buffer_count: usize) -> Self {
        Self {
            handle,
            buffer_count,
            written: 0,
        }
    }

    pub fn status(&self) -> &FileStatus {
        self.handle.status()
    }

    /// Bytes accepted by this writer so far.
    pub fn position(&self) -> u64 {
        self.written
    }

    /// Reader sharing this writer's handle. It sees unflushed bytes of the
    /// current block without a store round trip.
    pub fn reader(&self) -> FileReader {
        FileReader::shared(self.handle.clone(), self.buffer_count)
    }

    pub async fn write(&mut self, data: &[u8]) -> BfsResult<()> {
        self.handle.write(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub async fn flush(&mut self) -> BfsResult<()> {
        self.handle.flush().await
    }

    pub async fn truncate(&mut self, offset: u64) -> BfsResult<()> {
        self.handle.truncate(offset).await
    }

    /// Flushes pending bytes and closes the handle. The close still runs
    /// when the flush fails, the first error wins.
    pub async fn close(&mut self) -> BfsResult<()> {
        let flushed = self.handle.flush().await;
        let closed = self.handle.close().await;
        flushed.and(closed)
    }
}

impl fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWriter")
            .field("path", self.handle.status().path())
            .field("written", &self.written)
            .finish()
    }
}
