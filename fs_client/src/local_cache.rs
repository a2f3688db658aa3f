use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use blockfs_lib::{BfsResult, BlockSource};

/// One cached block file on local disk.
#[derive(Debug, Clone)]
pub struct LocalBlockFile {
    pub version: u64,
    pub path: PathBuf,
}

/// Parse a cache entry name of the form `{blockId}.{version}`, both decimal.
/// Anything else, including signs, blanks or extra dots, is not a cache entry.
fn parse_block_file_name(name: &str) -> Option<(u64, u64)> {
    let (id_part, version_part) = name.split_once('.')?;
    if id_part.is_empty() || version_part.is_empty() {
        return None;
    }
    if !id_part.bytes().all(|b| b.is_ascii_digit())
        || !version_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let block_id = id_part.parse::<u64>().ok()?;
    let version = version_part.parse::<u64>().ok()?;
    Some((block_id, version))
}

/// Snapshot of the co-located block cache directory for one file, taken when
/// its handle opens.
///
/// Per block id only the highest version survives; a version tie keeps the
/// entry seen later in the listing. The snapshot is immutable afterwards, so
/// blocks cached after open are not visible to this handle.
pub struct LocalBlockCacheIndex {
    dir: PathBuf,
    entries: HashMap<u64, LocalBlockFile>,
}

impl LocalBlockCacheIndex {
    /// List `dir` once and build the index. An unreadable or missing
    /// directory yields an empty index, never an error: the handle then
    /// reads every block remotely.
    pub async fn build(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let mut index = Self {
            dir: dir.clone(),
            entries: HashMap::new(),
        };
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) => {
                warn!("local block cache dir {} unreadable: {}", dir.display(), e);
                return index;
            }
        };
        loop {
            let entry = match read_dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("listing {} stopped early: {}", dir.display(), e);
                    break;
                }
            };
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((block_id, version)) = parse_block_file_name(name) {
                index.insert_entry(block_id, version, entry.path());
            }
        }
        debug!(
            "local block cache index for {} holds {} block(s)",
            dir.display(),
            index.entries.len()
        );
        index
    }

    fn insert_entry(&mut self, block_id: u64, version: u64, path: PathBuf) {
        match self.entries.get(&block_id) {
            Some(existing) if existing.version > version => {}
            _ => {
                self.entries
                    .insert(block_id, LocalBlockFile { version, path });
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, block_id: u64) -> Option<&LocalBlockFile> {
        self.entries.get(&block_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open the cached file for `block_id`, capped at `block_size` bytes.
    /// `Ok(None)` means the index has no entry for this block; an `Err` means
    /// the entry exists but could not be opened (counts as a local failure).
    pub async fn open_block(&self, block_id: u64, block_size: u64) -> BfsResult<Option<BlockSource>> {
        let entry = match self.entries.get(&block_id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let file = File::open(&entry.path).await?;
        let source: BlockSource = Box::pin(file.take(block_size));
        Ok(Some(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn read_all(mut source: BlockSource) -> Vec<u8> {
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_parse_block_file_name() {
        assert_eq!(parse_block_file_name("7.3"), Some((7, 3)));
        assert_eq!(parse_block_file_name("007.02"), Some((7, 2)));
        assert_eq!(parse_block_file_name("0.0"), Some((0, 0)));
        assert_eq!(parse_block_file_name("12"), None);
        assert_eq!(parse_block_file_name("7."), None);
        assert_eq!(parse_block_file_name(".3"), None);
        assert_eq!(parse_block_file_name("7.3.1"), None);
        assert_eq!(parse_block_file_name("+7.3"), None);
        assert_eq!(parse_block_file_name("7.-3"), None);
        assert_eq!(parse_block_file_name("block7.3"), None);
        assert_eq!(parse_block_file_name(""), None);
    }

    #[tokio::test]
    async fn test_highest_version_wins() {
        let temp = TempDir::new().unwrap();
        for name in ["7.1", "7.3", "7.2", "9.5", "junk", "8.x"] {
            tokio::fs::write(temp.path().join(name), name.as_bytes())
                .await
                .unwrap();
        }
        let index = LocalBlockCacheIndex::build(temp.path()).await;
        assert_eq!(index.len(), 2);

        let entry = index.get(7).unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.path.file_name().unwrap(), "7.3");
        assert_eq!(index.get(9).unwrap().version, 5);
        assert!(index.get(8).is_none());
    }

    #[test]
    fn test_version_tie_keeps_later_entry() {
        let mut index = LocalBlockCacheIndex {
            dir: PathBuf::from("/nowhere"),
            entries: HashMap::new(),
        };
        index.insert_entry(7, 3, PathBuf::from("/cache/7.3"));
        index.insert_entry(7, 3, PathBuf::from("/cache/07.3"));
        assert_eq!(index.get(7).unwrap().path, PathBuf::from("/cache/07.3"));

        index.insert_entry(7, 2, PathBuf::from("/cache/7.2"));
        assert_eq!(index.get(7).unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty_index() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("no-such-dir");
        let index = LocalBlockCacheIndex::build(&missing).await;
        assert!(index.is_empty());
        assert!(index.open_block(0, 4096).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_block_reads_capped_content() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join("3.1"), b"0123456789")
            .await
            .unwrap();
        let index = LocalBlockCacheIndex::build(temp.path()).await;

        let source = index.open_block(3, 4).await.unwrap().unwrap();
        assert_eq!(read_all(source).await, b"0123");

        let source = index.open_block(3, 64).await.unwrap().unwrap();
        assert_eq!(read_all(source).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_open_block_vanished_file_is_error() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join("4.1"), b"data").await.unwrap();
        let index = LocalBlockCacheIndex::build(temp.path()).await;
        tokio::fs::remove_file(temp.path().join("4.1")).await.unwrap();

        assert!(index.open_block(4, 16).await.is_err());
    }

    #[tokio::test]
    async fn test_subdirectories_ignored() {
        let temp = TempDir::new().unwrap();
        tokio::fs::create_dir(temp.path().join("5.9")).await.unwrap();
        tokio::fs::write(temp.path().join("5.1"), b"x").await.unwrap();
        let index = LocalBlockCacheIndex::build(temp.path()).await;
        assert_eq!(index.get(5).unwrap().version, 1);
    }
}
