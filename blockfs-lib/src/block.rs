//! Block addressing arithmetic.
//!
//! Files are stored as a sequence of fixed-size blocks; the last block may be
//! short. These helpers map between byte offsets and block coordinates. They
//! are pure and never fail: all quantities are unsigned and a zero block size
//! is rejected by configuration validation before any of this runs.

/// Number of blocks needed to hold `size` bytes.
pub fn block_count(size: u64, block_size: u64) -> u64 {
    debug_assert!(block_size > 0);
    size.div_ceil(block_size)
}

/// Zero-based id of the block containing the byte at `offset`.
pub fn block_id(offset: u64, block_size: u64) -> u64 {
    debug_assert!(block_size > 0);
    offset / block_size
}

/// File offset of the first byte of `block_id`.
pub fn block_start(block_id: u64, block_size: u64) -> u64 {
    debug_assert!(block_size > 0);
    block_id * block_size
}

/// Offset of the byte at `offset` within its block.
pub fn in_block_offset(offset: u64, block_size: u64) -> u64 {
    debug_assert!(block_size > 0);
    offset % block_size
}

/// Valid byte count of `block_id` in a file of `file_size` bytes, clamped to
/// zero for blocks past the end.
pub fn block_len(file_size: u64, block_size: u64, block_id: u64) -> u64 {
    debug_assert!(block_size > 0);
    file_size
        .saturating_sub(block_start(block_id, block_size))
        .min(block_size)
}
