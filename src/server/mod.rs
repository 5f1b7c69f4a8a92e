//! Accepting and dialling peer connections.
//!
//! Every stream starts with a HELLO exchange; after that the stream belongs
//! to a [`FramedConnection`] registered with the model.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ConfigWrapper;
use crate::connection::{EventSender, FramedConnection};
use crate::model::Model;
use crate::protocol::{handshake, write_frame, Close, Hello};
use crate::types::DeviceId;

/// How long a peer gets to complete the HELLO exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake on a fresh stream and hand it to the model.
///
/// Peers that are not declared in the configuration are told why and
/// dropped.
pub async fn establish<R, W>(
    mut reader: R,
    mut writer: W,
    model: &Model,
    config: &ConfigWrapper,
    events: EventSender,
) -> Result<DeviceId>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let ours = Hello::new(model.device_id(), crate::CLIENT_NAME);
    let theirs = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut reader, &mut writer, &ours))
        .await
        .context("Handshake timed out")??;
    let device = theirs.device_id;

    let refusal = if device == model.device_id() {
        Some("connected to self")
    } else if config.get().device(&device).is_none() {
        Some("unknown device")
    } else {
        None
    };
    if let Some(reason) = refusal {
        let close = Close {
            reason: reason.to_string(),
        };
        write_frame(&mut writer, &close.encode()).await?;
        writer.flush().await?;
        anyhow::bail!("Refusing device {}: {}", device.short(), reason);
    }

    debug!(device = %device.short(), client = %theirs.client_name, "handshake complete");
    // Registered before reading so the peer's cluster config finds it
    let conn = FramedConnection::open(device, writer);
    model.add_connection(conn.clone());
    conn.start(reader, events);
    Ok(device)
}

/// Accept peer connections until the listener fails.
pub async fn accept_loop(
    listener: TcpListener,
    model: Arc<Model>,
    config: Arc<ConfigWrapper>,
    events: EventSender,
) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let model = model.clone();
        let config = config.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, "set_nodelay failed: {}", e);
            }
            let (reader, writer) = stream.into_split();
            match establish(reader, writer, &model, &config, events).await {
                Ok(device) => info!(%addr, device = %device.short(), "accepted connection"),
                Err(e) => warn!(%addr, "incoming connection failed: {:#}", e),
            }
        });
    }
}

/// Connect to a peer and hand the connection to the model.
pub async fn dial(
    addr: SocketAddr,
    model: &Model,
    config: &ConfigWrapper,
    events: EventSender,
) -> Result<DeviceId> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let device = establish(reader, writer, model, config, events).await?;
    info!(%addr, device = %device.short(), "connected");
    Ok(device)
}
