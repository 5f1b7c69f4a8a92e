//! Peer connections.
//!
//! A connection never calls back into the model. Everything it receives, and
//! its own termination, is reported as a [`ConnectionEvent`] on a channel the
//! model consumes.

pub mod framed;

pub use framed::FramedConnection;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::RequestError;
use crate::protocol::{BlockRequest, ClusterConfig, Index};
use crate::types::DeviceId;

/// Capacity of the connection -> model event channel
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// Distinguishes successive connections to the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Sending side of a peer connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> DeviceId;

    fn connection_id(&self) -> ConnectionId;

    /// Queue our cluster configuration.
    fn cluster_config(&self, config: ClusterConfig);

    /// Queue an index (durable or temporary) for sending.
    fn index(&self, index: Index) -> Result<(), RequestError>;

    /// Ask the peer for a block.
    async fn request(&self, request: &BlockRequest) -> Result<Bytes, RequestError>;

    /// Tear the connection down. Pending and later requests fail with `Closed`.
    fn close(&self, reason: &str);
}

/// Reply channel for an inbound request
pub type ReplySender = oneshot::Sender<Result<Bytes, RequestError>>;

/// Something a connection received or observed
#[derive(Debug)]
pub enum ConnectionEvent {
    ClusterConfig {
        device: DeviceId,
        config: ClusterConfig,
    },
    Index {
        device: DeviceId,
        index: Index,
    },
    Request {
        device: DeviceId,
        request: BlockRequest,
        reply: ReplySender,
    },
    Closed {
        device: DeviceId,
        connection: ConnectionId,
        reason: String,
    },
}

pub type EventSender = mpsc::Sender<ConnectionEvent>;
pub type EventReceiver = mpsc::Receiver<ConnectionEvent>;

/// Create the bounded event channel for connections -> model
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_SIZE)
}
