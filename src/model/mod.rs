//! The model: owns every index and routes traffic between peers and storage.
//!
//! Connections report what they receive through [`ConnectionEvent`]s; the
//! model consumes them in [`Model::run`].

pub mod lifecycle;
pub mod router;

pub use lifecycle::{ConnectionState, Connections};
pub use router::{RequestRouter, MAX_BLOCK_SIZE};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::connection::{ConnectionEvent, EventReceiver};
use crate::error::{FetchError, RequestError};
use crate::index::{
    Availability, AvailabilityResolver, DeviceActivity, DurableIndex, FolderSharing,
    ProgressRegistry, TempIndex,
};
use crate::protocol::{BlockRequest, Features};
use crate::storage::BlockStorage;
use crate::types::{BlockHash, BlockInfo, DeviceId};

pub struct Model {
    device_id: DeviceId,
    sharing: Arc<dyn FolderSharing>,
    durable: Arc<dyn DurableIndex>,
    temp: Arc<TempIndex>,
    activity: Arc<DeviceActivity>,
    progress: Arc<ProgressRegistry>,
    connections: Arc<Connections>,
    resolver: Arc<AvailabilityResolver>,
    router: RequestRouter,
}

impl Model {
    pub fn new(
        device_id: DeviceId,
        sharing: Arc<dyn FolderSharing>,
        durable: Arc<dyn DurableIndex>,
        storage: Arc<dyn BlockStorage>,
    ) -> Self {
        let temp = Arc::new(TempIndex::new());
        let activity = Arc::new(DeviceActivity::new());
        let progress = Arc::new(ProgressRegistry::new());
        let connections = Arc::new(Connections::new());
        let resolver = Arc::new(AvailabilityResolver::new(
            durable.clone(),
            temp.clone(),
            sharing.clone(),
            connections.clone(),
        ));
        let router = RequestRouter {
            device_id,
            sharing: sharing.clone(),
            durable: durable.clone(),
            progress: progress.clone(),
            storage,
            resolver: resolver.clone(),
            activity: activity.clone(),
            connections: connections.clone(),
        };

        Self {
            device_id,
            sharing,
            durable,
            temp,
            activity,
            progress,
            connections,
            resolver,
            router,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// In-progress pulls; the puller registers and deregisters here.
    pub fn progress(&self) -> &Arc<ProgressRegistry> {
        &self.progress
    }

    pub fn activity(&self) -> &Arc<DeviceActivity> {
        &self.activity
    }

    pub fn connection_state(&self, device: &DeviceId) -> ConnectionState {
        self.connections.state(device)
    }

    /// Features negotiated with `device`; empty if not (yet) known
    pub fn features(&self, device: &DeviceId) -> Features {
        self.connections.features(device)
    }

    /// Devices with a live connection, sorted
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections.devices()
    }

    /// Which connected devices can serve `hash` of `folder`/`file`, and how.
    pub fn availability(&self, folder: &str, file: &str, hash: &BlockHash) -> HashMap<DeviceId, Availability> {
        self.resolver.availability(folder, file, hash)
    }

    /// Serve a block request from `device`.
    pub async fn request(&self, device: DeviceId, request: &BlockRequest) -> Result<Bytes, RequestError> {
        self.router.serve(&device, request).await
    }

    /// Fetch and verify a block from whichever peer can provide it.
    pub async fn fetch_block(&self, folder: &str, file: &str, block: &BlockInfo) -> Result<Bytes, FetchError> {
        self.router.fetch(folder, file, block).await
    }

    /// Consume connection events until every sender is gone.
    ///
    /// Requests are served on their own tasks so a slow disk read never
    /// holds up index or close handling.
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::ClusterConfig { device, config } => {
                    self.cluster_config(device, config);
                }
                ConnectionEvent::Index { device, index } => {
                    self.index_update(device, index);
                }
                ConnectionEvent::Request {
                    device,
                    request,
                    reply,
                } => {
                    let model = self.clone();
                    tokio::spawn(async move {
                        let result = model.request(device, &request).await;
                        if let Err(e) = &result {
                            debug!(device = %device.short(), folder = %request.folder, file = %request.name, "request failed: {}", e);
                        }
                        let _ = reply.send(result);
                    });
                }
                ConnectionEvent::Closed {
                    device,
                    connection,
                    reason,
                } => {
                    self.close_connection(device, connection, &reason);
                }
            }
        }
        info!("event channel closed, model stopping");
    }
}
