use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::{BfsResult, StatusInfo, StorePath};

/// Byte source for one block, produced by a store read or a local cache hit.
/// Pulled lazily; dropping it abandons the rest of the block.
pub type BlockSource = Pin<Box<dyn AsyncRead + Unpin + Send>>;

/// Opaque token identifying one open-file session on the store. Returned by
/// `open` and required by every per-file call after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor(pub u64);

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Write access. Opening a non-existent path in this mode creates it.
    Write,
}

/// Asynchronous protocol surface of the remote block store.
///
/// One instance is shared by every handle of a filesystem instance, so
/// implementations must tolerate concurrent independent calls (a keepalive
/// for one descriptor runs while another descriptor reads). Retry policy
/// lives behind this trait, never in front of it.
#[async_trait]
pub trait RemoteStoreClient: Send + Sync {
    /// Metadata snapshot for `path`. `None` means the path does not exist,
    /// which is a normal answer and not an error.
    async fn stat(&self, path: &StorePath) -> BfsResult<Option<StatusInfo>>;

    /// Open a session for `path`. In write mode a missing path is created.
    async fn open(&self, path: &StorePath, mode: OpenMode) -> BfsResult<Descriptor>;

    /// Stream up to `block_size` bytes starting at the block-aligned
    /// `block_offset`. A source shorter than `block_size` means end of file.
    async fn read_block(
        &self,
        descriptor: Descriptor,
        block_offset: u64,
        block_size: u64,
    ) -> BfsResult<BlockSource>;

    /// Write `data` at the block-aligned `block_offset`. `data` may be short
    /// for the trailing block and may rewrite a previously sent prefix.
    async fn write_block(
        &self,
        descriptor: Descriptor,
        block_offset: u64,
        data: &[u8],
    ) -> BfsResult<()>;

    async fn truncate(&self, descriptor: Descriptor, offset: u64) -> BfsResult<()>;

    async fn close(&self, descriptor: Descriptor) -> BfsResult<()>;

    /// Renew the lease backing `descriptor`. Called periodically by the
    /// handle's keepalive task.
    async fn extend_lease(&self, descriptor: Descriptor) -> BfsResult<()>;

    /// Names of the direct children of a directory.
    async fn list_directory(&self, path: &StorePath) -> BfsResult<Vec<String>>;

    async fn get_xattr(&self, path: &StorePath, name: &str) -> BfsResult<Vec<u8>>;

    async fn mkdir(&self, path: &StorePath) -> BfsResult<()>;

    /// Remove a file or an empty directory.
    async fn remove(&self, path: &StorePath) -> BfsResult<()>;

    async fn rename(&self, from: &StorePath, to: &StorePath) -> BfsResult<()>;

    /// Best-effort teardown of the underlying connection(s), called once at
    /// filesystem shutdown.
    async fn disconnect(&self) -> BfsResult<()> {
        Ok(())
    }
}
