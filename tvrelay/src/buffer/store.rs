//! Segment store for rotating `.ts` buffer files.
//!
//! Each stream owns one folder in the store and writes numbered segments
//! (`1.ts`, `2.ts`, ...) into it. The supervisor is the only writer of a
//! folder, every viewer of the stream reads from it concurrently.
//!
//! Two backends are provided:
//! - [`MemoryStore`]: a virtual file tree kept in RAM
//! - [`DiskStore`]: plain files below a temp directory

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Hierarchical file store used for stream segments.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Create a directory and all of its parents.
    async fn create_dir_all(&self, dir: &Path) -> io::Result<()>;

    /// Remove a directory and everything below it.
    async fn remove_all(&self, dir: &Path) -> io::Result<()>;

    /// Create an empty file, truncating an existing one. The parent directory
    /// must exist.
    async fn create(&self, path: &Path) -> io::Result<()>;

    /// Append data to an existing file.
    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Read a whole file.
    async fn read(&self, path: &Path) -> io::Result<Bytes>;

    /// Size of a file in bytes.
    async fn stat(&self, path: &Path) -> io::Result<u64>;

    /// Names of the files directly inside a directory.
    async fn list(&self, dir: &Path) -> io::Result<Vec<String>>;

    /// Remove a single file.
    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// File name of segment `seq`.
pub fn segment_name(seq: u64) -> String {
    format!("{}.ts", seq)
}

/// Parse a segment file name back into its sequence number.
pub fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_suffix(".ts")?.parse().ok()
}

/// Sequence numbers of all segments in `dir`, ascending.
pub async fn list_segments(store: &dyn SegmentStore, dir: &Path) -> io::Result<Vec<u64>> {
    let mut seqs: Vec<u64> = store
        .list(dir)
        .await?
        .iter()
        .filter_map(|name| parse_segment_name(name))
        .collect();
    seqs.sort_unstable();
    Ok(seqs)
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
}

#[derive(Debug, Default)]
struct MemoryTree {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

/// In-memory segment store.
///
/// Every operation completes without yielding; the lock is never held across
/// an await point.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tree: RwLock<MemoryTree>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SegmentStore for MemoryStore {
    async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        for ancestor in dir.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            tree.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    async fn remove_all(&self, dir: &Path) -> io::Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        if !tree.dirs.contains(dir) {
            return Err(not_found(dir));
        }
        tree.dirs.retain(|d| !d.starts_with(dir));
        tree.files.retain(|f, _| !f.starts_with(dir));
        Ok(())
    }

    async fn create(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        if !parent.as_os_str().is_empty() && !tree.dirs.contains(parent) {
            return Err(not_found(parent));
        }
        tree.files.insert(path.to_path_buf(), Vec::new());
        Ok(())
    }

    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        let file = tree.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.extend_from_slice(data);
        Ok(())
    }

    async fn read(&self, path: &Path) -> io::Result<Bytes> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.files
            .get(path)
            .map(|data| Bytes::copy_from_slice(data))
            .ok_or_else(|| not_found(path))
    }

    async fn stat(&self, path: &Path) -> io::Result<u64> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.files
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| not_found(path))
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        if !tree.dirs.contains(dir) {
            return Err(not_found(dir));
        }
        Ok(tree
            .files
            .keys()
            .filter(|f| f.parent() == Some(dir))
            .filter_map(|f| f.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.files.remove(path).map(|_| ()).ok_or_else(|| not_found(path))
    }
}

/// Segment store backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskStore;

impl DiskStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SegmentStore for DiskStore {
    async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir).await
    }

    async fn remove_all(&self, dir: &Path) -> io::Result<()> {
        fs::remove_dir_all(dir).await
    }

    async fn create(&self, path: &Path) -> io::Result<()> {
        fs::File::create(path).await.map(|_| ())
    }

    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = fs::OpenOptions::new().append(true).open(path).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    async fn read(&self, path: &Path) -> io::Result<Bytes> {
        fs::read(path).await.map(Bytes::from)
    }

    async fn stat(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path).await
    }
}
