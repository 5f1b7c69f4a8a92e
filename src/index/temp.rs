//! Temporary index: which blocks of in-progress files each peer can serve.
//!
//! Each (device, folder) pair owns one snapshot that is replaced wholesale on
//! every temporary index update, never merged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{BlockHash, DeviceId, FileInfo, FileKey, FolderId};

/// Blocks obtainable per file from one device's partial transfers in one folder
type Snapshot = HashMap<FileKey, HashSet<BlockHash>>;

#[derive(Debug, Default)]
pub struct TempIndex {
    // device -> folder -> snapshot
    indexes: RwLock<HashMap<DeviceId, HashMap<FolderId, Arc<Snapshot>>>>,
}

impl TempIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the temporary index of `device` for `folder`.
    ///
    /// An empty file list clears it.
    pub fn update(&self, device: DeviceId, folder: &str, files: &[FileInfo]) {
        // Built outside the lock; only the swap is exclusive
        let snapshot: Snapshot = files
            .iter()
            .map(|file| {
                let blocks = file.blocks.iter().map(|b| b.hash).collect();
                (FileKey::new(folder, file.name.clone()), blocks)
            })
            .collect();

        let mut indexes = self.indexes.write();
        if snapshot.is_empty() {
            if let Some(folders) = indexes.get_mut(&device) {
                folders.remove(folder);
                if folders.is_empty() {
                    indexes.remove(&device);
                }
            }
        } else {
            indexes
                .entry(device)
                .or_default()
                .insert(folder.to_string(), Arc::new(snapshot));
        }
    }

    /// Devices whose temporary index for `folder`/`file` contains `hash`.
    pub fn lookup(&self, folder: &str, file: &str, hash: &BlockHash) -> HashSet<DeviceId> {
        let key = FileKey::new(folder, file);
        let indexes = self.indexes.read();
        indexes
            .iter()
            .filter(|(_, folders)| {
                folders
                    .get(folder)
                    .and_then(|snapshot| snapshot.get(&key))
                    .is_some_and(|blocks| blocks.contains(hash))
            })
            .map(|(device, _)| *device)
            .collect()
    }

    /// Drop every snapshot held for `device`.
    pub fn remove_device(&self, device: &DeviceId) {
        self.indexes.write().remove(device);
    }

    /// Number of devices with at least one non-empty snapshot
    pub fn device_count(&self) -> usize {
        self.indexes.read().len()
    }
}
