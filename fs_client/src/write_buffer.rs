/// Accumulates stream writes into one block-sized buffer.
///
/// The buffer always starts at a block-aligned file offset and holds the
/// written prefix of that block. A full buffer is written out as one aligned
/// block and the window advances; a partial flush sends the current prefix
/// but keeps accumulating into the same block, so the next flush after more
/// appends re-sends the whole grown prefix at the same block offset. All
/// store I/O is driven by the handle, this type only tracks bytes.
pub struct WriteBuffer {
    block_size: u64,
    /// File offset of `buf[0]`, advances in whole blocks only.
    block_start: u64,
    buf: Vec<u8>,
    /// How many bytes of `buf` the store has already seen.
    flushed: usize,
}

impl WriteBuffer {
    pub fn new(block_size: u64) -> Self {
        debug_assert!(block_size > 0);
        Self {
            block_size,
            block_start: 0,
            buf: Vec::with_capacity(block_size as usize),
            flushed: 0,
        }
    }

    /// Copy as much of `data` as fits into the current block, returning the
    /// number of bytes consumed. Zero means the buffer is full.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let room = self.block_size as usize - self.buf.len();
        let take = room.min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        take
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() as u64 == self.block_size
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn has_unflushed(&self) -> bool {
        self.buf.len() > self.flushed
    }

    /// Next byte this buffer would accept, as a file offset.
    pub fn position(&self) -> u64 {
        self.block_start + self.buf.len() as u64
    }

    /// The full block payload, only valid while `is_full()`.
    pub fn full_payload(&self) -> (u64, &[u8]) {
        debug_assert!(self.is_full());
        (self.block_start, &self.buf)
    }

    /// Payload for an explicit flush: the whole accumulated prefix of the
    /// current block, or `None` when the store already has every byte.
    pub fn flush_payload(&self) -> Option<(u64, &[u8])> {
        if self.has_unflushed() {
            Some((self.block_start, &self.buf))
        } else {
            None
        }
    }

    /// Bytes currently buffered for the block at `block_start`, flushed or
    /// not. The read path overlays these over store content.
    pub fn buffered_span(&self) -> Option<(u64, &[u8])> {
        if self.buf.is_empty() {
            None
        } else {
            Some((self.block_start, &self.buf))
        }
    }

    /// Move the window to the next block after a full-block write.
    pub fn advance_block(&mut self) {
        debug_assert!(self.is_full());
        self.block_start += self.block_size;
        self.buf.clear();
        self.flushed = 0;
    }

    /// Record that the whole current prefix reached the store.
    pub fn mark_flushed(&mut self) {
        self.flushed = self.buf.len();
    }
}
