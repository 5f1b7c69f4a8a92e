//! Registry of files this node is currently assembling from peers.
//!
//! The blocks already written to a staging file can be served to other peers
//! before the file is complete; the registry turns them into a temporary
//! index.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::{BlockHash, BlockInfo, FileInfo, FileKey, FolderId};

/// Local bookkeeping for one in-progress pull.
#[derive(Debug)]
pub struct PulledFileState {
    folder: FolderId,
    file: FileInfo,
    /// Staging file path, relative to the folder root
    temp_name: String,
    available: Mutex<HashSet<BlockHash>>,
}

impl PulledFileState {
    pub fn new(folder: impl Into<FolderId>, file: FileInfo, temp_name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            file,
            temp_name: temp_name.into(),
            available: Mutex::new(HashSet::new()),
        }
    }

    /// Start from a set of blocks already present in the staging file.
    pub fn with_available<'a>(self, blocks: impl IntoIterator<Item = &'a BlockInfo>) -> Self {
        self.available.lock().extend(blocks.into_iter().map(|b| b.hash));
        self
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn file(&self) -> &FileInfo {
        &self.file
    }

    pub fn temp_name(&self) -> &str {
        &self.temp_name
    }

    pub fn key(&self) -> FileKey {
        FileKey::new(self.folder.clone(), self.file.name.clone())
    }

    /// Record that a block has been written to the staging file.
    pub fn block_done(&self, block: &BlockInfo) {
        self.available.lock().insert(block.hash);
    }

    /// The block of this file with `hash`, if it is already available locally.
    pub fn available_block(&self, hash: &BlockHash) -> Option<BlockInfo> {
        if !self.available.lock().contains(hash) {
            return None;
        }
        self.file.block(hash).copied()
    }

    /// Blocks of the file available locally, in file order
    pub fn available_blocks(&self) -> Vec<BlockInfo> {
        let available = self.available.lock();
        self.file
            .blocks
            .iter()
            .filter(|b| available.contains(&b.hash))
            .copied()
            .collect()
    }
}

/// In-progress pulls keyed by (folder, file name)
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    registry: RwLock<HashMap<FileKey, Arc<PulledFileState>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pull, replacing any earlier one for the same file.
    pub fn register(&self, state: Arc<PulledFileState>) {
        tracing::debug!(folder = state.folder(), file = %state.file.name, "registering pull");
        self.registry.write().insert(state.key(), state);
    }

    /// Remove a pull. A newer registration for the same file is left alone.
    pub fn deregister(&self, state: &Arc<PulledFileState>) {
        let mut registry = self.registry.write();
        let key = state.key();
        if registry.get(&key).is_some_and(|cur| Arc::ptr_eq(cur, state)) {
            tracing::debug!(folder = state.folder(), file = %state.file.name, "deregistering pull");
            registry.remove(&key);
        }
    }

    pub fn get(&self, folder: &str, name: &str) -> Option<Arc<PulledFileState>> {
        self.registry.read().get(&FileKey::new(folder, name)).cloned()
    }

    /// Synthetic index entries for every pull in `folder`, each restricted to
    /// the blocks already available locally. Sorted by name.
    pub fn temporary_index(&self, folder: &str) -> Vec<FileInfo> {
        let states: Vec<Arc<PulledFileState>> = self
            .registry
            .read()
            .values()
            .filter(|s| s.folder == folder)
            .cloned()
            .collect();

        let mut files: Vec<FileInfo> = states
            .iter()
            .map(|s| FileInfo {
                name: s.file.name.clone(),
                version: s.file.version,
                blocks: s.available_blocks(),
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks() -> Vec<BlockInfo> {
        (0..6u8)
            .map(|i| BlockInfo {
                hash: BlockHash::of(&[i; 8]),
                offset: i as i64 * 8,
                size: 8,
            })
            .collect()
    }

    fn pull(folder: &str, name: &str, blocks: &[BlockInfo]) -> PulledFileState {
        PulledFileState::new(
            folder,
            FileInfo {
                name: name.into(),
                version: 3,
                blocks: blocks.to_vec(),
            },
            format!(".blockshare.{name}.tmp"),
        )
    }

    #[test]
    fn test_temporary_index_restricts_to_available() {
        let blocks = blocks();
        let state = Arc::new(pull("x", "file", &blocks).with_available([&blocks[4], &blocks[1]]));
        let registry = ProgressRegistry::new();
        registry.register(state.clone());

        let index = registry.temporary_index("x");
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].name, "file");
        assert_eq!(index[0].version, 3);
        // File order, not insertion order
        assert_eq!(index[0].blocks, vec![blocks[1], blocks[4]]);

        state.block_done(&blocks[0]);
        assert_eq!(registry.temporary_index("x")[0].blocks.len(), 3);
        assert!(registry.temporary_index("y").is_empty());
    }

    #[test]
    fn test_register_replaces_same_key() {
        let blocks = blocks();
        let registry = ProgressRegistry::new();
        let first = Arc::new(pull("x", "file", &blocks));
        let second = Arc::new(pull("x", "file", &blocks[..2]));

        registry.register(first.clone());
        registry.register(second.clone());
        assert_eq!(registry.len(), 1);

        // Stale deregistration does not remove the replacement
        registry.deregister(&first);
        assert!(registry.get("x", "file").is_some());

        registry.deregister(&second);
        assert!(registry.get("x", "file").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_available_block() {
        let blocks = blocks();
        let state = pull("x", "file", &blocks).with_available([&blocks[2]]);
        assert_eq!(state.available_block(&blocks[2].hash), Some(blocks[2]));
        assert_eq!(state.available_block(&blocks[3].hash), None);
        assert_eq!(state.available_block(&BlockHash::of(b"other")), None);
    }

    #[test]
    fn test_same_name_in_different_folders() {
        let blocks = blocks();
        let registry = ProgressRegistry::new();
        registry.register(Arc::new(pull("x", "file", &blocks)));
        registry.register(Arc::new(pull("y", "file", &blocks)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.temporary_index("x").len(), 1);
        assert_eq!(registry.temporary_index("y").len(), 1);
        assert_eq!(registry.get("y", "file").unwrap().folder(), "y");
    }
}
