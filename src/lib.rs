//! Block availability tracking and routing for peer-to-peer file sync.
//!
//! Peers advertise which files they hold completely (durable index) and,
//! when both sides support it, which blocks of in-progress files they can
//! already serve (temporary index). Outbound block requests go to the least
//! busy peer that has the block; inbound requests are answered from complete
//! files or staging files.

pub mod config;
pub mod connection;
pub mod error;
pub mod index;
pub mod model;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod types;

pub use error::{Error, FetchError, RequestError, Result};
pub use model::{ConnectionState, Model};
pub use types::{BlockHash, BlockInfo, DeviceId, FileInfo, FolderId};

/// Client name announced in HELLO and cluster config messages
pub const CLIENT_NAME: &str = "blockshare";

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
