//! Identifiers and file metadata shared by every layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a device identifier in bytes
pub const DEVICE_ID_LEN: usize = 32;

/// Length of a block hash in bytes (BLAKE3)
pub const HASH_LEN: usize = 32;

/// Identifier of a shared folder.
pub type FolderId = String;

// =============================================================================
// DeviceId
// =============================================================================

/// Fixed-size opaque peer identifier.
///
/// Ordered so that ties between equally loaded devices can be broken
/// deterministically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    pub const fn new(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    /// Short form used in log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid device id {0:?}: expected {DEVICE_ID_LEN} hex-encoded bytes")]
pub struct ParseDeviceIdError(String);

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; DEVICE_ID_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|_| ParseDeviceIdError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// BlockHash
// =============================================================================

/// Content hash of one block of file data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash([u8; HASH_LEN]);

impl BlockHash {
    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash a block of data
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// =============================================================================
// FileKey
// =============================================================================

/// Composite (folder, file) key.
///
/// Kept as a struct rather than a joined path so that two distinct pairs can
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    pub folder: FolderId,
    pub name: String,
}

impl FileKey {
    pub fn new(folder: impl Into<FolderId>, name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.folder, self.name)
    }
}

// =============================================================================
// Block / file metadata
// =============================================================================

/// One element of a file's ordered block list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub offset: i64,
    pub size: u32,
}

impl BlockInfo {
    /// Whether `data` is the content of this block
    pub fn verify(&self, data: &[u8]) -> bool {
        data.len() == self.size as usize && BlockHash::of(data) == self.hash
    }
}

/// File metadata as carried by index messages
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub name: String,
    /// Monotonic version marker; higher is newer
    pub version: u64,
    pub blocks: Vec<BlockInfo>,
}

impl FileInfo {
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size as u64).sum()
    }

    /// Find a block of this file by hash
    pub fn block(&self, hash: &BlockHash) -> Option<&BlockInfo> {
        self.blocks.iter().find(|b| b.hash == *hash)
    }
}
