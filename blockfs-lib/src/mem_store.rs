use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    BfsError, BfsResult, BlockSource, Descriptor, NodeKind, OpenMode, RemoteStoreClient,
    StatusInfo, StorePath, DEFAULT_BLOCK_SIZE,
};

/// Configuration tag selecting a store backend. Mapped to a concrete client
/// at compile time by `make_store_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Memory
    }
}

pub fn make_store_client(backend: StoreBackend, block_size: u64) -> Arc<dyn RemoteStoreClient> {
    match backend {
        StoreBackend::Memory => Arc::new(MemStore::new(block_size)),
    }
}

/// One `write_block` call as seen by the store, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWriteRecord {
    pub descriptor: Descriptor,
    pub block_offset: u64,
    pub len: usize,
}

#[derive(Debug, Default)]
pub struct StoreCounters {
    stat: AtomicU64,
    open: AtomicU64,
    read_block: AtomicU64,
    write_block: AtomicU64,
    extend_lease: AtomicU64,
    close: AtomicU64,
    disconnect: AtomicU64,
}

impl StoreCounters {
    pub fn stat_count(&self) -> u64 {
        self.stat.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> u64 {
        self.open.load(Ordering::SeqCst)
    }

    pub fn read_block_count(&self) -> u64 {
        self.read_block.load(Ordering::SeqCst)
    }

    pub fn write_block_count(&self) -> u64 {
        self.write_block.load(Ordering::SeqCst)
    }

    pub fn extend_lease_count(&self) -> u64 {
        self.extend_lease.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.close.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> u64 {
        self.disconnect.load(Ordering::SeqCst)
    }
}

struct Node {
    kind: NodeKind,
    data: Vec<u8>,
    block_size: u64,
    mode: u32,
    modify_time: u64,
    access_time: u64,
    xattrs: HashMap<String, Vec<u8>>,
}

impl Node {
    fn new_file(block_size: u64, now: u64) -> Self {
        Self {
            kind: NodeKind::File,
            data: Vec::new(),
            block_size,
            mode: 0o644,
            modify_time: now,
            access_time: now,
            xattrs: HashMap::new(),
        }
    }

    fn new_dir(now: u64) -> Self {
        Self {
            kind: NodeKind::Dir,
            data: Vec::new(),
            block_size: 0,
            mode: 0o755,
            modify_time: now,
            access_time: now,
            xattrs: HashMap::new(),
        }
    }

    fn to_status(&self) -> StatusInfo {
        StatusInfo {
            kind: self.kind,
            size: self.data.len() as u64,
            block_size: self.block_size,
            modify_time: self.modify_time,
            access_time: self.access_time,
            mode: self.mode,
        }
    }
}

struct Session {
    path: StorePath,
    mode: OpenMode,
}

struct StoreState {
    nodes: HashMap<StorePath, Node>,
    sessions: HashMap<Descriptor, Session>,
}

/// In-process `RemoteStoreClient` backend.
///
/// Holds the whole namespace in memory: one byte vector per file, a session
/// table keyed by descriptor. Every operation is counted and block writes are
/// journaled so tests can assert on the exact store traffic. A failure switch
/// turns every subsequent store call into a remote error.
pub struct MemStore {
    block_size: u64,
    next_descriptor: AtomicU64,
    fail_switch: AtomicBool,
    state: Mutex<StoreState>,
    counters: StoreCounters,
    write_log: Mutex<Vec<BlockWriteRecord>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl MemStore {
    /// `block_size` is assigned to every file this store creates.
    pub fn new(block_size: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(StorePath::new("/"), Node::new_dir(Self::now_unix_secs()));
        Self {
            block_size,
            next_descriptor: AtomicU64::new(1),
            fail_switch: AtomicBool::new(false),
            state: Mutex::new(StoreState {
                nodes,
                sessions: HashMap::new(),
            }),
            counters: StoreCounters::default(),
            write_log: Mutex::new(Vec::new()),
        }
    }

    fn now_unix_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    pub fn counters(&self) -> &StoreCounters {
        &self.counters
    }

    pub fn write_log(&self) -> Vec<BlockWriteRecord> {
        self.write_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn open_session_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.sessions.len())
            .unwrap_or(0)
    }

    /// When set, every store call fails with a remote error until cleared.
    pub fn set_fail(&self, fail: bool) {
        self.fail_switch.store(fail, Ordering::SeqCst);
    }

    pub fn set_xattr(&self, path: &StorePath, name: &str, value: Vec<u8>) -> BfsResult<()> {
        let mut state = self.lock_state()?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| BfsError::NotFound(format!("path not found: {}", path)))?;
        node.xattrs.insert(name.to_string(), value);
        Ok(())
    }

    fn lock_state(&self) -> BfsResult<std::sync::MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| BfsError::InvalidState("store state lock poisoned".to_string()))
    }

    fn check_fail(&self, op: &str) -> BfsResult<()> {
        if self.fail_switch.load(Ordering::SeqCst) {
            return Err(BfsError::RemoteError(format!("injected failure: {}", op)));
        }
        Ok(())
    }

    /// Create missing ancestor directories of `path`, like the real store
    /// does for create and mkdir requests.
    fn ensure_parent_dirs(state: &mut StoreState, path: &StorePath, now: u64) -> BfsResult<()> {
        let mut missing = Vec::new();
        let mut cursor = path.clone();
        while let Some((parent, _)) = cursor.split_parent_name() {
            match state.nodes.get(&parent) {
                Some(node) if node.kind == NodeKind::Dir => break,
                Some(_) => {
                    return Err(BfsError::NotDirectory(format!(
                        "ancestor is a file: {}",
                        parent
                    )))
                }
                None => {
                    missing.push(parent.clone());
                    cursor = parent;
                }
            }
        }
        for dir in missing.into_iter().rev() {
            state.nodes.insert(dir, Node::new_dir(now));
        }
        Ok(())
    }

    fn session_path(state: &StoreState, descriptor: Descriptor) -> BfsResult<(StorePath, OpenMode)> {
        let session = state
            .sessions
            .get(&descriptor)
            .ok_or_else(|| BfsError::NotFound(format!("descriptor not open: {}", descriptor)))?;
        Ok((session.path.clone(), session.mode))
    }

    fn ensure_write_session(mode: OpenMode) -> BfsResult<()> {
        if mode != OpenMode::Write {
            return Err(BfsError::PermissionDenied(
                "descriptor opened read-only".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStoreClient for MemStore {
    async fn stat(&self, path: &StorePath) -> BfsResult<Option<StatusInfo>> {
        self.check_fail("stat")?;
        self.counters.stat.fetch_add(1, Ordering::SeqCst);
        let state = self.lock_state()?;
        Ok(state.nodes.get(path).map(|node| node.to_status()))
    }

    async fn open(&self, path: &StorePath, mode: OpenMode) -> BfsResult<Descriptor> {
        self.check_fail("open")?;
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        let now = Self::now_unix_secs();
        let mut state = self.lock_state()?;
        match state.nodes.get(path) {
            Some(node) if node.kind == NodeKind::Dir => {
                return Err(BfsError::NotFile(format!("open on directory: {}", path)));
            }
            Some(_) => {}
            None => {
                if mode == OpenMode::Read {
                    return Err(BfsError::NotFound(format!("path not found: {}", path)));
                }
                Self::ensure_parent_dirs(&mut state, path, now)?;
                state
                    .nodes
                    .insert(path.clone(), Node::new_file(self.block_size, now));
            }
        }
        let descriptor = Descriptor(self.next_descriptor.fetch_add(1, Ordering::SeqCst));
        state.sessions.insert(
            descriptor,
            Session {
                path: path.clone(),
                mode,
            },
        );
        debug!("mem store opened {} as descriptor {}", path, descriptor);
        Ok(descriptor)
    }

    async fn read_block(
        &self,
        descriptor: Descriptor,
        block_offset: u64,
        block_size: u64,
    ) -> BfsResult<BlockSource> {
        self.check_fail("read_block")?;
        self.counters.read_block.fetch_add(1, Ordering::SeqCst);
        let state = self.lock_state()?;
        let (path, _) = Self::session_path(&state, descriptor)?;
        let node = state
            .nodes
            .get(&path)
            .ok_or_else(|| BfsError::NotFound(format!("path not found: {}", path)))?;
        if node.block_size > 0 && block_offset % node.block_size != 0 {
            return Err(BfsError::InvalidParam(format!(
                "unaligned block offset {} for block size {}",
                block_offset, node.block_size
            )));
        }
        let start = (block_offset as usize).min(node.data.len());
        let end = (block_offset + block_size).min(node.data.len() as u64) as usize;
        let chunk = node.data[start..end].to_vec();
        Ok(Box::pin(std::io::Cursor::new(chunk)))
    }

    async fn write_block(
        &self,
        descriptor: Descriptor,
        block_offset: u64,
        data: &[u8],
    ) -> BfsResult<()> {
        self.check_fail("write_block")?;
        self.counters.write_block.fetch_add(1, Ordering::SeqCst);
        let now = Self::now_unix_secs();
        let mut state = self.lock_state()?;
        let (path, mode) = Self::session_path(&state, descriptor)?;
        Self::ensure_write_session(mode)?;
        let node = state
            .nodes
            .get_mut(&path)
            .ok_or_else(|| BfsError::NotFound(format!("path not found: {}", path)))?;
        if node.block_size > 0 {
            if block_offset % node.block_size != 0 {
                return Err(BfsError::InvalidParam(format!(
                    "unaligned block offset {} for block size {}",
                    block_offset, node.block_size
                )));
            }
            if data.len() as u64 > node.block_size {
                return Err(BfsError::InvalidParam(format!(
                    "block write of {} bytes exceeds block size {}",
                    data.len(),
                    node.block_size
                )));
            }
        }
        let end = block_offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[block_offset as usize..end].copy_from_slice(data);
        node.modify_time = now;
        self.write_log
            .lock()
            .map_err(|_| BfsError::InvalidState("write log lock poisoned".to_string()))?
            .push(BlockWriteRecord {
                descriptor,
                block_offset,
                len: data.len(),
            });
        Ok(())
    }

    async fn truncate(&self, descriptor: Descriptor, offset: u64) -> BfsResult<()> {
        self.check_fail("truncate")?;
        let now = Self::now_unix_secs();
        let mut state = self.lock_state()?;
        let (path, mode) = Self::session_path(&state, descriptor)?;
        Self::ensure_write_session(mode)?;
        let node = state
            .nodes
            .get_mut(&path)
            .ok_or_else(|| BfsError::NotFound(format!("path not found: {}", path)))?;
        node.data.resize(offset as usize, 0);
        node.modify_time = now;
        Ok(())
    }

    async fn close(&self, descriptor: Descriptor) -> BfsResult<()> {
        self.check_fail("close")?;
        self.counters.close.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock_state()?;
        state
            .sessions
            .remove(&descriptor)
            .ok_or_else(|| BfsError::NotFound(format!("descriptor not open: {}", descriptor)))?;
        debug!("mem store closed descriptor {}", descriptor);
        Ok(())
    }

    async fn extend_lease(&self, descriptor: Descriptor) -> BfsResult<()> {
        self.check_fail("extend_lease")?;
        let state = self.lock_state()?;
        Self::session_path(&state, descriptor)?;
        self.counters.extend_lease.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_directory(&self, path: &StorePath) -> BfsResult<Vec<String>> {
        self.check_fail("list_directory")?;
        let state = self.lock_state()?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| BfsError::NotFound(format!("path not found: {}", path)))?;
        if node.kind != NodeKind::Dir {
            return Err(BfsError::NotDirectory(format!("not a directory: {}", path)));
        }
        let mut names: Vec<String> = state
            .nodes
            .keys()
            .filter(|candidate| candidate.is_child_of(path))
            .filter_map(|candidate| candidate.file_name())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_xattr(&self, path: &StorePath, name: &str) -> BfsResult<Vec<u8>> {
        self.check_fail("get_xattr")?;
        let state = self.lock_state()?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| BfsError::NotFound(format!("path not found: {}", path)))?;
        node.xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| BfsError::NotFound(format!("xattr not found: {} on {}", name, path)))
    }

    async fn mkdir(&self, path: &StorePath) -> BfsResult<()> {
        self.check_fail("mkdir")?;
        let now = Self::now_unix_secs();
        let mut state = self.lock_state()?;
        match state.nodes.get(path) {
            Some(node) if node.kind == NodeKind::Dir => return Ok(()),
            Some(_) => {
                return Err(BfsError::AlreadyExists(format!(
                    "file exists at: {}",
                    path
                )))
            }
            None => {}
        }
        Self::ensure_parent_dirs(&mut state, path, now)?;
        state.nodes.insert(path.clone(), Node::new_dir(now));
        Ok(())
    }

    async fn remove(&self, path: &StorePath) -> BfsResult<()> {
        self.check_fail("remove")?;
        let mut state = self.lock_state()?;
        if path.is_root() {
            return Err(BfsError::InvalidParam("cannot remove root".to_string()));
        }
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| BfsError::NotFound(format!("path not found: {}", path)))?;
        if node.kind == NodeKind::Dir {
            let has_children = state
                .nodes
                .keys()
                .any(|candidate| candidate.is_child_of(path));
            if has_children {
                return Err(BfsError::InvalidState(format!(
                    "directory not empty: {}",
                    path
                )));
            }
        }
        state.nodes.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &StorePath, to: &StorePath) -> BfsResult<()> {
        self.check_fail("rename")?;
        let now = Self::now_unix_secs();
        let mut state = self.lock_state()?;
        if !state.nodes.contains_key(from) {
            return Err(BfsError::NotFound(format!("path not found: {}", from)));
        }
        if state.nodes.contains_key(to) {
            return Err(BfsError::AlreadyExists(format!("target exists: {}", to)));
        }
        Self::ensure_parent_dirs(&mut state, to, now)?;
        let prefix = format!("{}/", from.as_str());
        let moved: Vec<StorePath> = state
            .nodes
            .keys()
            .filter(|key| key.as_str() == from.as_str() || key.as_str().starts_with(&prefix))
            .cloned()
            .collect();
        for old_key in moved {
            if let Some(node) = state.nodes.remove(&old_key) {
                let suffix = &old_key.as_str()[from.as_str().len()..];
                let new_key = StorePath::new(format!("{}{}", to.as_str(), suffix));
                state.nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> BfsResult<()> {
        self.counters.disconnect.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut source: BlockSource) -> Vec<u8> {
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_open_write_read_round_trip() {
        let store = MemStore::new(8);
        let path = StorePath::new("/dir/file.bin");

        let fd = store.open(&path, OpenMode::Write).await.unwrap();
        store.write_block(fd, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        store.write_block(fd, 8, &[9, 10]).await.unwrap();

        let status = store.stat(&path).await.unwrap().unwrap();
        assert_eq!(status.kind, NodeKind::File);
        assert_eq!(status.size, 10);
        assert_eq!(status.block_size, 8);

        // parent directory was created implicitly
        let parent = store.stat(&StorePath::new("/dir")).await.unwrap().unwrap();
        assert_eq!(parent.kind, NodeKind::Dir);

        let source = store.read_block(fd, 8, 8).await.unwrap();
        assert_eq!(read_all(source).await, vec![9, 10]);
        let source = store.read_block(fd, 16, 8).await.unwrap();
        assert!(read_all(source).await.is_empty());

        store.close(fd).await.unwrap();
        assert_eq!(store.open_session_count(), 0);
        assert!(store.close(fd).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_write_requires_write_session() {
        let store = MemStore::new(8);
        let path = StorePath::new("/a");
        let wfd = store.open(&path, OpenMode::Write).await.unwrap();
        store.write_block(wfd, 0, &[1]).await.unwrap();
        store.close(wfd).await.unwrap();

        let rfd = store.open(&path, OpenMode::Read).await.unwrap();
        let err = store.write_block(rfd, 0, &[2]).await.unwrap_err();
        assert!(err.is_permission_denied());
        let err = store.truncate(rfd, 0).await.unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn test_unaligned_and_oversized_writes_rejected() {
        let store = MemStore::new(8);
        let fd = store
            .open(&StorePath::new("/a"), OpenMode::Write)
            .await
            .unwrap();
        let err = store.write_block(fd, 3, &[1]).await.unwrap_err();
        assert!(matches!(err, BfsError::InvalidParam(_)));
        let err = store.write_block(fd, 0, &[0; 9]).await.unwrap_err();
        assert!(matches!(err, BfsError::InvalidParam(_)));
    }

    #[tokio::test]
    async fn test_list_and_rename_directory() {
        let store = MemStore::new(8);
        store.mkdir(&StorePath::new("/top/sub")).await.unwrap();
        let fd = store
            .open(&StorePath::new("/top/sub/a.bin"), OpenMode::Write)
            .await
            .unwrap();
        store.write_block(fd, 0, &[7; 4]).await.unwrap();
        store.close(fd).await.unwrap();

        let names = store.list_directory(&StorePath::new("/top")).await.unwrap();
        assert_eq!(names, vec!["sub".to_string()]);

        store
            .rename(&StorePath::new("/top"), &StorePath::new("/moved"))
            .await
            .unwrap();
        assert!(store.stat(&StorePath::new("/top")).await.unwrap().is_none());
        let status = store
            .stat(&StorePath::new("/moved/sub/a.bin"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.size, 4);
    }

    #[tokio::test]
    async fn test_remove_semantics() {
        let store = MemStore::new(8);
        store.mkdir(&StorePath::new("/d")).await.unwrap();
        let fd = store
            .open(&StorePath::new("/d/f"), OpenMode::Write)
            .await
            .unwrap();
        store.close(fd).await.unwrap();

        let err = store.remove(&StorePath::new("/d")).await.unwrap_err();
        assert!(matches!(err, BfsError::InvalidState(_)));

        store.remove(&StorePath::new("/d/f")).await.unwrap();
        store.remove(&StorePath::new("/d")).await.unwrap();
        assert!(store.stat(&StorePath::new("/d")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_switch() {
        let store = MemStore::new(8);
        let fd = store
            .open(&StorePath::new("/a"), OpenMode::Write)
            .await
            .unwrap();
        store.set_fail(true);
        assert!(matches!(
            store.stat(&StorePath::new("/a")).await.unwrap_err(),
            BfsError::RemoteError(_)
        ));
        assert!(store.extend_lease(fd).await.is_err());
        store.set_fail(false);
        store.extend_lease(fd).await.unwrap();
        assert_eq!(store.counters().extend_lease_count(), 1);
    }
}
