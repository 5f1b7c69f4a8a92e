//! Durable index: the complete files each device holds.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{DeviceId, FileInfo, FileKey};

/// The replicated record of which complete files each device holds.
pub trait DurableIndex: Send + Sync {
    /// Devices that hold the newest known version of `folder`/`file` in full.
    fn availability(&self, folder: &str, file: &str) -> Vec<DeviceId>;

    /// Merge index entries announced by `device` for `folder`.
    fn update(&self, device: DeviceId, folder: &str, files: &[FileInfo]);

    /// The entry `device` holds for `folder`/`file`, if any.
    fn get(&self, device: &DeviceId, folder: &str, file: &str) -> Option<FileInfo>;

    /// Every entry `device` holds in `folder`, sorted by name.
    fn files(&self, device: &DeviceId, folder: &str) -> Vec<FileInfo>;
}

/// In-memory durable index.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    files: RwLock<HashMap<FileKey, HashMap<DeviceId, FileInfo>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableIndex for MemoryIndex {
    fn availability(&self, folder: &str, file: &str) -> Vec<DeviceId> {
        let files = self.files.read();
        let Some(holders) = files.get(&FileKey::new(folder, file)) else {
            return Vec::new();
        };
        let Some(newest) = holders.values().map(|f| f.version).max() else {
            return Vec::new();
        };
        let mut devices: Vec<DeviceId> = holders
            .iter()
            .filter(|(_, f)| f.version == newest)
            .map(|(device, _)| *device)
            .collect();
        devices.sort();
        devices
    }

    fn update(&self, device: DeviceId, folder: &str, files: &[FileInfo]) {
        let mut index = self.files.write();
        for file in files {
            index
                .entry(FileKey::new(folder, file.name.clone()))
                .or_default()
                .insert(device, file.clone());
        }
    }

    fn get(&self, device: &DeviceId, folder: &str, file: &str) -> Option<FileInfo> {
        self.files
            .read()
            .get(&FileKey::new(folder, file))
            .and_then(|holders| holders.get(device))
            .cloned()
    }

    fn files(&self, device: &DeviceId, folder: &str) -> Vec<FileInfo> {
        let mut files: Vec<FileInfo> = self
            .files
            .read()
            .iter()
            .filter(|(key, _)| key.folder == folder)
            .filter_map(|(_, holders)| holders.get(device).cloned())
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }
}
