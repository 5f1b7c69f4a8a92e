//! Block request routing.
//!
//! Inbound: serve blocks from completed files or from the staging files of
//! in-progress pulls. Outbound: pick the least busy peer that has a block and
//! fall back to the next one on failure.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{FetchError, RequestError};
use crate::index::{AvailabilityResolver, DeviceActivity, DurableIndex, FolderSharing, ProgressRegistry};
use crate::model::lifecycle::Connections;
use crate::protocol::BlockRequest;
use crate::storage::{BlockStorage, StorageKey};
use crate::types::{BlockInfo, DeviceId};

/// Largest block a peer may ask for (16MB)
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

pub struct RequestRouter {
    pub(crate) device_id: DeviceId,
    pub(crate) sharing: Arc<dyn FolderSharing>,
    pub(crate) durable: Arc<dyn DurableIndex>,
    pub(crate) progress: Arc<ProgressRegistry>,
    pub(crate) storage: Arc<dyn BlockStorage>,
    pub(crate) resolver: Arc<AvailabilityResolver>,
    pub(crate) activity: Arc<DeviceActivity>,
    pub(crate) connections: Arc<Connections>,
}

/// Whether the request's hash, offset and size together name one of `blocks`.
fn names_block(blocks: &[BlockInfo], req: &BlockRequest) -> bool {
    blocks
        .iter()
        .any(|b| b.hash == req.hash && b.offset == req.offset && b.size == req.size)
}

impl RequestRouter {
    /// Serve a block request from `requester` out of local storage.
    pub async fn serve(&self, requester: &DeviceId, req: &BlockRequest) -> Result<Bytes, RequestError> {
        if !self.sharing.is_shared(requester, &req.folder) {
            debug!(device = %requester.short(), folder = %req.folder, "request for unshared folder");
            return Err(RequestError::NoSuchFile);
        }
        if req.offset < 0 || req.size > MAX_BLOCK_SIZE {
            return Err(RequestError::Invalid);
        }

        // Metadata lookups finish before any disk I/O starts
        let key = if req.is_temporary() {
            self.temporary_source(req)?
        } else {
            self.durable_source(req)?
        };

        self.storage
            .read_at(&key, req.offset, req.size as usize)
            .await
            .map_err(|e| {
                warn!(folder = %req.folder, file = %req.name, "block read failed: {}", e);
                RequestError::from(e)
            })
    }

    fn temporary_source(&self, req: &BlockRequest) -> Result<StorageKey, RequestError> {
        // No registered pull means the block is not available as partial data
        let Some(state) = self.progress.get(&req.folder, &req.name) else {
            return Err(RequestError::Invalid);
        };
        if state.available_block(&req.hash).is_none() || !names_block(&state.file().blocks, req) {
            return Err(RequestError::Invalid);
        }
        Ok(StorageKey::new(req.folder.clone(), state.temp_name()))
    }

    fn durable_source(&self, req: &BlockRequest) -> Result<StorageKey, RequestError> {
        let Some(file) = self.durable.get(&self.device_id, &req.folder, &req.name) else {
            return Err(RequestError::NoSuchFile);
        };
        if !names_block(&file.blocks, req) {
            return Err(RequestError::Invalid);
        }
        Ok(StorageKey::new(req.folder.clone(), req.name.clone()))
    }

    /// Fetch `block` of `folder`/`name` from the least busy peer that has it.
    ///
    /// Each failed or corrupt answer moves on to the next least busy
    /// candidate; the error is returned once every candidate has failed.
    pub async fn fetch(&self, folder: &str, name: &str, block: &BlockInfo) -> Result<Bytes, FetchError> {
        let mut candidates = self.resolver.availability(folder, name, &block.hash);
        if candidates.is_empty() {
            return Err(FetchError::NoCandidates);
        }

        let mut attempts = 0;
        let mut last = RequestError::Closed;

        while let Some(device) = self.activity.least_busy(candidates.keys()) {
            let Some(mode) = candidates.remove(&device) else {
                break;
            };
            attempts += 1;

            let Some(conn) = self.connections.get(&device) else {
                debug!(device = %device.short(), "candidate disconnected");
                last = RequestError::Closed;
                continue;
            };

            let req = BlockRequest::for_block(folder, name, block, mode.request_flags());
            let result = {
                let _busy = self.activity.busy(device);
                conn.request(&req).await
            };

            match result {
                Ok(data) if block.verify(&data) => return Ok(data),
                Ok(_) => {
                    warn!(device = %device.short(), folder, file = name, hash = %block.hash, "block hash mismatch");
                    last = RequestError::Invalid;
                }
                Err(e) => {
                    debug!(device = %device.short(), folder, file = name, mode = ?mode, "block request failed: {}", e);
                    last = e;
                }
            }
        }

        Err(FetchError::Exhausted { attempts, last })
    }
}
