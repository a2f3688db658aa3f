use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::StorePath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

/// Store-reported metadata snapshot for one path, as returned by `stat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub kind: NodeKind,
    pub size: u64,
    pub block_size: u64,
    /// Seconds since the epoch, store clock.
    pub modify_time: u64,
    pub access_time: u64,
    /// Permission bits in the usual unix layout.
    pub mode: u32,
}

impl StatusInfo {
    pub fn new_file(size: u64, block_size: u64) -> Self {
        Self {
            kind: NodeKind::File,
            size,
            block_size,
            modify_time: 0,
            access_time: 0,
            mode: 0o644,
        }
    }

    pub fn new_dir() -> Self {
        Self {
            kind: NodeKind::Dir,
            size: 0,
            block_size: 0,
            modify_time: 0,
            access_time: 0,
            mode: 0o755,
        }
    }
}

struct StatusState {
    path: StorePath,
    kind: NodeKind,
    block_size: u64,
    remote_size: u64,
    modify_time: u64,
    access_time: u64,
    mode: u32,
    /// Client-side size view. Starts at `remote_size`; writes may only grow
    /// it, truncate rewrites it.
    local_size: AtomicU64,
    /// Sticky. Once set, every cache lookup for this path must miss until a
    /// fresh snapshot replaces the entry.
    dirty: AtomicBool,
}

/// Shared client view of one path's metadata.
///
/// Cloning is cheap and every clone observes the same dirty flag and size
/// view, so a handle closing with modifications is immediately visible to the
/// metadata cache holding the same status.
#[derive(Clone)]
pub struct FileStatus {
    state: Arc<StatusState>,
}

impl FileStatus {
    pub fn new(path: StorePath, info: &StatusInfo) -> Self {
        Self {
            state: Arc::new(StatusState {
                path,
                kind: info.kind,
                block_size: info.block_size,
                remote_size: info.size,
                modify_time: info.modify_time,
                access_time: info.access_time,
                mode: info.mode,
                local_size: AtomicU64::new(info.size),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> &StorePath {
        &self.state.path
    }

    pub fn kind(&self) -> NodeKind {
        self.state.kind
    }

    pub fn is_file(&self) -> bool {
        self.state.kind == NodeKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.state.kind == NodeKind::Dir
    }

    pub fn block_size(&self) -> u64 {
        self.state.block_size
    }

    /// Current size as seen by this client: the remote-reported size unless a
    /// local write extended it or a truncate rewrote it.
    pub fn size(&self) -> u64 {
        self.state.local_size.load(Ordering::SeqCst)
    }

    /// Size the store reported when this snapshot was taken.
    pub fn remote_size(&self) -> u64 {
        self.state.remote_size
    }

    /// `Some(size)` when the local view diverged from the remote snapshot.
    pub fn local_size_override(&self) -> Option<u64> {
        let local = self.size();
        if local != self.state.remote_size {
            Some(local)
        } else {
            None
        }
    }

    pub fn modify_time(&self) -> u64 {
        self.state.modify_time
    }

    pub fn access_time(&self) -> u64 {
        self.state.access_time
    }

    pub fn mode(&self) -> u32 {
        self.state.mode
    }

    pub fn is_dirty(&self) -> bool {
        self.state.dirty.load(Ordering::SeqCst)
    }

    /// Mark this snapshot stale. There is no way back, a fresh `stat` must
    /// produce a replacement.
    pub fn set_dirty(&self) {
        self.state.dirty.store(true, Ordering::SeqCst);
    }

    /// Record that a write extended the file. Only ever grows the size view:
    /// a smaller value than the current view is ignored.
    pub fn notify_size_changed(&self, new_size: u64) {
        self.state.local_size.fetch_max(new_size, Ordering::SeqCst);
    }

    /// Rewrite the size view unconditionally, used by truncate where the new
    /// size may shrink below the remote-reported one.
    pub fn force_size(&self, new_size: u64) {
        self.state.local_size.store(new_size, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStatus")
            .field("path", &self.state.path)
            .field("kind", &self.state.kind)
            .field("size", &self.size())
            .field("block_size", &self.state.block_size)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
