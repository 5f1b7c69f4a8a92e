#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use blockshare::config::{Config, ConfigWrapper, DeviceConfig, FolderConfig};
use blockshare::connection::{Connection, ConnectionId};
use blockshare::error::RequestError;
use blockshare::protocol::{BlockRequest, ClusterConfig, Index};
use blockshare::{BlockHash, BlockInfo, DeviceId, FileInfo};

pub const BLOCK_SIZE: usize = 64;

pub fn dev(b: u8) -> DeviceId {
    DeviceId::new([b; 32])
}

pub fn block_data(i: usize) -> Vec<u8> {
    vec![b'a' + i as u8; BLOCK_SIZE]
}

/// Eight distinct blocks laid out back to back
pub fn blocks() -> Vec<BlockInfo> {
    (0..8)
        .map(|i| BlockInfo {
            hash: BlockHash::of(&block_data(i)),
            offset: (i * BLOCK_SIZE) as i64,
            size: BLOCK_SIZE as u32,
        })
        .collect()
}

/// Content of a file holding every block of [`blocks`] at its offset
pub fn all_block_data() -> Vec<u8> {
    (0..8).flat_map(block_data).collect()
}

pub fn files() -> Vec<FileInfo> {
    let b = blocks();
    vec![
        FileInfo {
            name: "file1".into(),
            version: 100,
            blocks: vec![b[0], b[1], b[2]],
        },
        FileInfo {
            name: "file2".into(),
            version: 101,
            blocks: vec![b[3], b[4], b[5]],
        },
        FileInfo {
            name: "file3".into(),
            version: 102,
            blocks: vec![b[6], b[7]],
        },
    ]
}

pub fn config(me: DeviceId, devices: &[DeviceId], folders: &[(&str, &std::path::Path, &[DeviceId])]) -> Arc<ConfigWrapper> {
    Arc::new(ConfigWrapper::new(Config {
        device_id: me,
        listen: None,
        devices: devices
            .iter()
            .map(|id| DeviceConfig {
                id: *id,
                name: None,
                address: None,
            })
            .collect(),
        folders: folders
            .iter()
            .map(|(id, path, devices)| FolderConfig {
                id: id.to_string(),
                path: path.to_path_buf(),
                devices: devices.to_vec(),
            })
            .collect(),
    }))
}

/// In-memory connection that records what the model sends to it
pub struct FakeConnection {
    pub device: DeviceId,
    pub connection: ConnectionId,
    pub reply: Mutex<Result<Bytes, RequestError>>,
    pub cluster_configs: Mutex<Vec<ClusterConfig>>,
    pub indexes: Mutex<Vec<Index>>,
    pub requests: Mutex<Vec<BlockRequest>>,
    pub closed: Mutex<Option<String>>,
}

impl FakeConnection {
    pub fn new(device: DeviceId) -> Arc<Self> {
        Self::replying(device, Err(RequestError::Closed))
    }

    pub fn replying(device: DeviceId, reply: Result<Bytes, RequestError>) -> Arc<Self> {
        Arc::new(Self {
            device,
            connection: ConnectionId::next(),
            reply: Mutex::new(reply),
            cluster_configs: Mutex::new(Vec::new()),
            indexes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn id(&self) -> DeviceId {
        self.device
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    fn cluster_config(&self, config: ClusterConfig) {
        self.cluster_configs.lock().push(config);
    }

    fn index(&self, index: Index) -> Result<(), RequestError> {
        if self.closed.lock().is_some() {
            return Err(RequestError::Closed);
        }
        self.indexes.lock().push(index);
        Ok(())
    }

    async fn request(&self, request: &BlockRequest) -> Result<Bytes, RequestError> {
        self.requests.lock().push(request.clone());
        self.reply.lock().clone()
    }

    fn close(&self, reason: &str) {
        *self.closed.lock() = Some(reason.to_string());
    }
}
