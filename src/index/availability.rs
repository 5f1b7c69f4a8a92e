//! Merges durable and temporary availability into one candidate set.

use std::collections::HashMap;
use std::sync::Arc;

use crate::index::durable::DurableIndex;
use crate::index::temp::TempIndex;
use crate::protocol::RequestFlags;
use crate::types::{BlockHash, DeviceId};

/// How a device can serve a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// The device holds the complete current file
    Durable,
    /// The block sits in the device's in-progress staging file
    Temporary,
}

impl Availability {
    /// Flags to put on a request sent to a device with this availability
    pub fn request_flags(self) -> RequestFlags {
        match self {
            Availability::Durable => RequestFlags::empty(),
            Availability::Temporary => RequestFlags::TEMPORARY,
        }
    }
}

/// Which folders are shared with which devices.
pub trait FolderSharing: Send + Sync {
    fn is_shared(&self, device: &DeviceId, folder: &str) -> bool;

    /// Folders shared with `device`, sorted
    fn shared_folders(&self, device: &DeviceId) -> Vec<String>;
}

/// Live connection set.
pub trait ConnectionRegistry: Send + Sync {
    fn is_connected(&self, device: &DeviceId) -> bool;
}

pub struct AvailabilityResolver {
    durable: Arc<dyn DurableIndex>,
    temp: Arc<TempIndex>,
    sharing: Arc<dyn FolderSharing>,
    connections: Arc<dyn ConnectionRegistry>,
}

impl AvailabilityResolver {
    pub fn new(
        durable: Arc<dyn DurableIndex>,
        temp: Arc<TempIndex>,
        sharing: Arc<dyn FolderSharing>,
        connections: Arc<dyn ConnectionRegistry>,
    ) -> Self {
        Self {
            durable,
            temp,
            sharing,
            connections,
        }
    }

    /// Connected devices sharing `folder` that can serve `hash` of `file`.
    ///
    /// A device that is both durable and temporary is reported as durable.
    pub fn availability(
        &self,
        folder: &str,
        file: &str,
        hash: &BlockHash,
    ) -> HashMap<DeviceId, Availability> {
        let mut devices: HashMap<DeviceId, Availability> = self
            .temp
            .lookup(folder, file, hash)
            .into_iter()
            .map(|device| (device, Availability::Temporary))
            .collect();

        for device in self.durable.availability(folder, file) {
            devices.insert(device, Availability::Durable);
        }

        devices.retain(|device, _| {
            self.connections.is_connected(device) && self.sharing.is_shared(device, folder)
        });
        devices
    }
}
