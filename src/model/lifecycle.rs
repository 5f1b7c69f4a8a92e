//! Connection lifecycle: registration, feature negotiation and teardown.
//!
//! ```text
//! Connected -> NegotiatingFeatures -> Active -> Closed
//! ```
//!
//! A new connection for the same device starts again at `Connected`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId};
use crate::index::ConnectionRegistry;
use crate::model::Model;
use crate::protocol::{ClusterConfig, ConfigOption, Features, Index, IndexFlags, FEATURES_KEY};
use crate::types::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, our cluster config not yet sent
    Connected,
    /// Our cluster config sent, waiting for the peer's
    NegotiatingFeatures,
    /// Features known, indexes sent
    Active,
    Closed,
}

struct Entry {
    conn: Arc<dyn Connection>,
    state: ConnectionState,
    features: Features,
}

/// Live connections, one per device.
#[derive(Default)]
pub struct Connections {
    table: RwLock<HashMap<DeviceId, Entry>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` as its device's connection, returning the one it
    /// replaced.
    pub(crate) fn insert(&self, conn: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let entry = Entry {
            conn: conn.clone(),
            state: ConnectionState::Connected,
            features: Features::empty(),
        };
        self.table.write().insert(conn.id(), entry).map(|e| e.conn)
    }

    pub fn get(&self, device: &DeviceId) -> Option<Arc<dyn Connection>> {
        self.table.read().get(device).map(|e| e.conn.clone())
    }

    pub fn state(&self, device: &DeviceId) -> ConnectionState {
        self.table
            .read()
            .get(device)
            .map_or(ConnectionState::Closed, |e| e.state)
    }

    /// Negotiated features; empty until the peer's cluster config arrives
    pub fn features(&self, device: &DeviceId) -> Features {
        self.table
            .read()
            .get(device)
            .map_or(Features::empty(), |e| e.features)
    }

    fn set_state(&self, device: &DeviceId, state: ConnectionState) {
        if let Some(entry) = self.table.write().get_mut(device) {
            entry.state = state;
        }
    }

    /// Record the peer's features and move to `Active`.
    ///
    /// Features are fixed for the connection's lifetime, so this succeeds only
    /// once per connection.
    fn activate(&self, device: &DeviceId, features: Features) -> Option<Arc<dyn Connection>> {
        let mut table = self.table.write();
        let entry = table.get_mut(device)?;
        if entry.state == ConnectionState::Active {
            return None;
        }
        entry.state = ConnectionState::Active;
        entry.features = features;
        Some(entry.conn.clone())
    }

    /// Remove the device's connection; with `only`, just if it is that one.
    fn remove(&self, device: &DeviceId, only: Option<ConnectionId>) -> Option<Arc<dyn Connection>> {
        let mut table = self.table.write();
        if let Some(only) = only {
            if table.get(device)?.conn.connection_id() != only {
                return None;
            }
        }
        table.remove(device).map(|e| e.conn)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.table.read().keys().copied().collect();
        devices.sort();
        devices
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

impl ConnectionRegistry for Connections {
    fn is_connected(&self, device: &DeviceId) -> bool {
        self.table.read().contains_key(device)
    }
}

impl Model {
    /// Our own cluster configuration message
    pub fn cluster_config_message(&self) -> ClusterConfig {
        ClusterConfig {
            client_name: crate::CLIENT_NAME.to_string(),
            client_version: crate::CLIENT_VERSION.to_string(),
            options: vec![ConfigOption {
                key: FEATURES_KEY.to_string(),
                value: Features::supported().marshal(),
            }],
        }
    }

    /// Register a new connection and send our cluster configuration.
    pub fn add_connection(&self, conn: Arc<dyn Connection>) {
        let device = conn.id();
        if let Some(old) = self.connections.insert(conn.clone()) {
            warn!(device = %device.short(), "replacing existing connection");
            self.release(device, old, "replaced by new connection");
        }
        info!(device = %device.short(), "connection added");

        // State moves first so a fast reply cannot be overwritten
        self.connections
            .set_state(&device, ConnectionState::NegotiatingFeatures);
        conn.cluster_config(self.cluster_config_message());
    }

    /// Handle the peer's cluster configuration.
    ///
    /// Sends the durable index for every folder shared with the peer and, if
    /// the peer supports it, a temporary index of our in-progress pulls.
    pub fn cluster_config(&self, device: DeviceId, config: ClusterConfig) {
        let features = config.features();
        let Some(conn) = self.connections.activate(&device, features) else {
            match self.connections.state(&device) {
                ConnectionState::Closed => {
                    warn!(device = %device.short(), "cluster config from unconnected device")
                }
                _ => warn!(device = %device.short(), "ignoring repeated cluster config"),
            }
            return;
        };
        info!(
            device = %device.short(),
            client = %config.client_name,
            version = %config.client_version,
            features = ?features,
            "peer cluster config"
        );

        for folder in self.sharing.shared_folders(&device) {
            let files = self.durable.files(&self.device_id, &folder);
            debug!(device = %device.short(), folder = %folder, files = files.len(), "sending index");
            let index = Index {
                folder: folder.clone(),
                flags: IndexFlags::empty(),
                files,
            };
            if let Err(e) = conn.index(index) {
                debug!(device = %device.short(), "index send failed: {}", e);
                return;
            }

            if features.contains(Features::TEMPORARY_INDEX) {
                let files = self.progress.temporary_index(&folder);
                debug!(device = %device.short(), folder = %folder, files = files.len(), "sending temporary index");
                let index = Index {
                    folder,
                    flags: IndexFlags::TEMPORARY,
                    files,
                };
                if let Err(e) = conn.index(index) {
                    debug!(device = %device.short(), "temporary index send failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Apply an index received from `device`.
    pub fn index_update(&self, device: DeviceId, index: Index) {
        if !self.sharing.is_shared(&device, &index.folder) {
            warn!(device = %device.short(), folder = %index.folder, "index for unshared folder");
            return;
        }
        if !self.connections.is_connected(&device) {
            debug!(device = %device.short(), "index from unconnected device");
            return;
        }

        debug!(
            device = %device.short(),
            folder = %index.folder,
            files = index.files.len(),
            temporary = index.is_temporary(),
            "index update"
        );
        if index.is_temporary() {
            self.temp.update(device, &index.folder, &index.files);
        } else {
            self.durable.update(device, &index.folder, &index.files);
        }
    }

    /// Tear down the device's connection and forget its volatile state.
    ///
    /// Requests in flight toward the device fail with `Closed`; its activity
    /// counter and temporary indexes are dropped.
    pub fn close(&self, device: DeviceId, reason: &str) {
        self.close_matching(device, None, reason);
    }

    /// Like [`Model::close`], but only if `connection` is still the device's
    /// current connection.
    pub fn close_connection(&self, device: DeviceId, connection: ConnectionId, reason: &str) {
        self.close_matching(device, Some(connection), reason);
    }

    fn close_matching(&self, device: DeviceId, only: Option<ConnectionId>, reason: &str) {
        // Removing from the live set first hides the device from availability
        // before its counters and snapshots are purged.
        let Some(conn) = self.connections.remove(&device, only) else {
            return;
        };
        self.release(device, conn, reason);
    }

    /// Close a connection already taken out of the table and drop the
    /// device's counters and temporary entries.
    fn release(&self, device: DeviceId, conn: Arc<dyn Connection>, reason: &str) {
        conn.close(reason);
        self.activity.reset(&device);
        self.temp.remove_device(&device);
        info!(device = %device.short(), reason, "connection closed");
    }

    /// Close every connection
    pub fn close_all(&self, reason: &str) {
        for device in self.connections.devices() {
            self.close(device, reason);
        }
    }
}
