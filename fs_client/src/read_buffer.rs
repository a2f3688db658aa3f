use std::collections::HashMap;

use log::debug;
use tokio::io::AsyncReadExt;

use blockfs_lib::{BfsResult, BlockSource};

/// Where a block buffer's bytes come from. Decides failure accounting and
/// whether the buffer may be cached across reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSourceKind {
    /// Co-located block cache file.
    Local,
    /// Store read stream.
    Remote,
    /// Snapshot of the handle's unflushed write window. Never cached, the
    /// window may grow right after this buffer was taken.
    WriteOverlay,
}

/// Holds one block's bytes, filled lazily from its source.
///
/// Two states: loading (a source is attached, more bytes may arrive) and
/// complete (source exhausted, block fully read, or closed early). Short
/// reads at the end of the valid bytes are normal, callers loop or treat
/// zero as end of file.
pub struct BlockBuffer {
    block_id: u64,
    start_offset: u64,
    block_size: u64,
    data: Vec<u8>,
    complete: bool,
    source: Option<BlockSource>,
    kind: BlockSourceKind,
}

impl BlockBuffer {
    pub fn new(
        block_id: u64,
        start_offset: u64,
        block_size: u64,
        source: BlockSource,
        kind: BlockSourceKind,
    ) -> Self {
        Self {
            block_id,
            start_offset,
            block_size,
            data: Vec::new(),
            complete: false,
            source: Some(source),
            kind,
        }
    }

    /// Buffer that is already complete, built from bytes the caller holds.
    pub fn from_bytes(block_id: u64, start_offset: u64, block_size: u64, data: Vec<u8>) -> Self {
        Self {
            block_id,
            start_offset,
            block_size,
            data,
            complete: true,
            source: None,
            kind: BlockSourceKind::WriteOverlay,
        }
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn loaded_len(&self) -> usize {
        self.data.len()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn kind(&self) -> BlockSourceKind {
        self.kind
    }

    /// Pull bytes from the source until at least `up_to` bytes are valid,
    /// the block is full, or the source ends. No-op once complete.
    pub async fn ensure_loaded(&mut self, up_to: usize) -> BfsResult<()> {
        if self.complete {
            return Ok(());
        }
        let up_to = up_to.min(self.block_size as usize);
        while self.data.len() < up_to {
            let source = match self.source.as_mut() {
                Some(source) => source,
                None => {
                    // closed early, whatever is loaded is all there is
                    self.complete = true;
                    return Ok(());
                }
            };
            let old_len = self.data.len();
            self.data.resize(up_to, 0);
            match source.read(&mut self.data[old_len..]).await {
                Ok(0) => {
                    self.data.truncate(old_len);
                    self.complete = true;
                    self.source = None;
                    return Ok(());
                }
                Ok(n) => {
                    self.data.truncate(old_len + n);
                }
                Err(e) => {
                    self.data.truncate(old_len);
                    return Err(e.into());
                }
            }
        }
        if self.data.len() as u64 >= self.block_size {
            self.complete = true;
            self.source = None;
        }
        Ok(())
    }

    /// Copy up to `dest.len()` valid bytes starting at `offset` within the
    /// block. Returns the bytes copied; zero means the block has no byte at
    /// `offset`, which at the trailing block is end of file.
    pub async fn read(&mut self, offset: usize, dest: &mut [u8]) -> BfsResult<usize> {
        self.ensure_loaded(offset + dest.len()).await?;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = (self.data.len() - offset).min(dest.len());
        dest[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    /// Drop the source without finishing the load. Used on eviction and on
    /// handle close.
    pub fn close(&mut self) {
        self.source = None;
    }
}

struct CacheSlot {
    buffer: BlockBuffer,
    seq: u64,
}

/// Fixed-capacity LRU of block buffers, one per reader.
///
/// Recency is a monotonic sequence number refreshed on access; eviction
/// closes the oldest buffer so its source stream is released.
pub struct BlockBufferCache {
    capacity: usize,
    next_seq: u64,
    slots: HashMap<u64, CacheSlot>,
}

impl BlockBufferCache {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            capacity,
            next_seq: 0,
            slots: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, block_id: u64) -> bool {
        self.slots.contains_key(&block_id)
    }

    pub fn get_mut(&mut self, block_id: u64) -> Option<&mut BlockBuffer> {
        let slot = self.slots.get_mut(&block_id)?;
        slot.seq = self.next_seq;
        self.next_seq += 1;
        Some(&mut slot.buffer)
    }

    /// Insert a buffer, evicting (and closing) the least recently used slot
    /// when the cache is full.
    pub fn insert(&mut self, buffer: BlockBuffer) {
        let block_id = buffer.block_id();
        if !self.slots.contains_key(&block_id) && self.slots.len() >= self.capacity {
            self.evict_oldest();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(block_id, CacheSlot { buffer, seq });
    }

    fn evict_oldest(&mut self) {
        let oldest_id = match self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.seq)
            .map(|(id, _)| *id)
        {
            Some(id) => id,
            None => return,
        };
        if let Some(mut slot) = self.slots.remove(&oldest_id) {
            slot.buffer.close();
            debug!("evicted block buffer {}", oldest_id);
        }
    }

    pub fn remove(&mut self, block_id: u64) -> Option<BlockBuffer> {
        self.slots.remove(&block_id).map(|slot| slot.buffer)
    }

    /// Close every buffer and empty the cache.
    pub fn close_all(&mut self) {
        for slot in self.slots.values_mut() {
            slot.buffer.close();
        }
        self.slots.clear();
    }
}
