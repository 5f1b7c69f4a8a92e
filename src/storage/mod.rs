//! Local byte-range reads from folder storage.
//!
//! Serves both completed files and the staging files of in-progress pulls.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::types::FolderId;

/// Prefix of staging file names
pub const TEMP_PREFIX: &str = ".blockshare.";

/// Suffix of staging file names
pub const TEMP_SUFFIX: &str = ".tmp";

/// Location of a file in local storage: folder plus path within it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub folder: FolderId,
    pub path: String,
}

impl StorageKey {
    pub fn new(folder: impl Into<FolderId>, path: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            path: path.into(),
        }
    }
}

/// Byte-range read primitive.
#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Read exactly `size` bytes at `offset`. A short read is an error.
    async fn read_at(&self, key: &StorageKey, offset: i64, size: usize) -> io::Result<Bytes>;
}

/// Staging file name for an in-progress file, in the same directory.
///
/// `docs/report.pdf` becomes `docs/.blockshare.report.pdf.tmp`.
pub fn temp_name(name: &str) -> String {
    match name.rsplit_once('/') {
        Some((dir, file)) => format!("{}/{}{}{}", dir, TEMP_PREFIX, file, TEMP_SUFFIX),
        None => format!("{}{}{}", TEMP_PREFIX, name, TEMP_SUFFIX),
    }
}

/// Whether `name` is a staging file name
pub fn is_temp_name(name: &str) -> bool {
    let file = name.rsplit_once('/').map_or(name, |(_, f)| f);
    file.starts_with(TEMP_PREFIX) && file.ends_with(TEMP_SUFFIX)
}

fn invalid_path(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
fn validate_path(root: &Path, relative: &str) -> io::Result<PathBuf> {
    if relative.is_empty() {
        return Err(invalid_path("Empty path not allowed".into()));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(invalid_path(format!("Absolute paths not allowed: {}", relative)));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(invalid_path(format!(
                    "Path traversal not allowed: {}",
                    relative
                )));
            }
            Component::Prefix(_) => {
                return Err(invalid_path(format!(
                    "Windows prefix paths not allowed: {}",
                    relative
                )));
            }
            _ => {}
        }
    }

    Ok(root.join(rel_path))
}

/// Filesystem storage rooted at each folder's configured path.
#[derive(Debug, Default)]
pub struct FsStorage {
    roots: RwLock<HashMap<FolderId, PathBuf>>,
}

impl FsStorage {
    pub fn new(roots: HashMap<FolderId, PathBuf>) -> Self {
        Self {
            roots: RwLock::new(roots),
        }
    }

    pub fn set_root(&self, folder: impl Into<FolderId>, root: PathBuf) {
        self.roots.write().insert(folder.into(), root);
    }

    fn resolve(&self, key: &StorageKey) -> io::Result<PathBuf> {
        let roots = self.roots.read();
        let root = roots.get(&key.folder).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Unknown folder: {}", key.folder),
            )
        })?;
        validate_path(root, &key.path)
    }
}

#[async_trait]
impl BlockStorage for FsStorage {
    async fn read_at(&self, key: &StorageKey, offset: i64, size: usize) -> io::Result<Bytes> {
        let offset = u64::try_from(offset)
            .map_err(|_| invalid_path(format!("Negative offset {} for {}", offset, key.path)))?;
        let full_path = self.resolve(key)?;

        let mut file = File::open(&full_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
