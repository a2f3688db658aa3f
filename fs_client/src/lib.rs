mod config;
mod facade;
mod file;
mod handle;
mod local_cache;
mod read_buffer;
mod status_cache;
mod write_buffer;


pub use config::{
    ClientConfig, DEFAULT_BLOCK_BUFFER_COUNT, DEFAULT_KEEPALIVE_INTERVAL_MS,
    DEFAULT_LOCAL_READ_FAIL_LIMIT, DEFAULT_STATUS_TTL_MS,
};
pub use facade::{BlockCacheLocator, BlockFs, FixedCacheRoot, NoLocalCache};
pub use file::{FileReader, FileWriter};
pub use handle::{FileHandle, HandleOptions};
pub use local_cache::{LocalBlockCacheIndex, LocalBlockFile};
pub use read_buffer::{BlockBuffer, BlockBufferCache, BlockSourceKind};
pub use status_cache::MetadataStatusCache;
pub use write_buffer::WriteBuffer;
