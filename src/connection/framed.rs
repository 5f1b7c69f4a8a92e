//! Connection over a byte stream using the framed peer protocol.
//!
//! Two tasks per connection: a writer draining the outbound queue, and a
//! reader matching responses to pending requests and forwarding everything
//! else as events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionEvent, ConnectionId, EventSender, ReplySender};
use crate::error::RequestError;
use crate::protocol::{
    read_frame, write_frame, BlockRequest, Close, ClusterConfig, ErrorCode, Index, MessageType,
    Request, Response,
};
use crate::types::DeviceId;

enum Outbound {
    Frame(Bytes),
    Shutdown,
}

pub struct FramedConnection {
    device: DeviceId,
    connection: ConnectionId,
    outbox: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<u32, ReplySender>>,
    next_id: AtomicU32,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl FramedConnection {
    /// Start the reader and writer tasks for an already-handshaken stream.
    pub fn spawn<R, W>(device: DeviceId, reader: R, writer: W, events: EventSender) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let conn = Self::open(device, writer);
        conn.start(reader, events);
        conn
    }

    /// Start only the writer. Messages can be queued, nothing is read until
    /// [`FramedConnection::start`].
    pub fn open<W>(device: DeviceId, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // Unbounded so queueing never blocks the caller; one queue per peer
        let (outbox, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            device,
            connection: ConnectionId::next(),
            outbox,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        });
        tokio::spawn(write_loop(device, writer, rx));
        conn
    }

    /// Start reading from the peer. Does nothing once closed.
    pub fn start<R>(self: &Arc<Self>, reader: R, events: EventSender)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut slot = self.reader.lock();
        if self.is_closed() || slot.is_some() {
            return;
        }
        *slot = Some(tokio::spawn(read_loop(self.clone(), reader, events)));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Bytes) -> Result<(), RequestError> {
        if self.is_closed() {
            return Err(RequestError::Closed);
        }
        self.outbox
            .send(Outbound::Frame(frame))
            .map_err(|_| RequestError::Closed)
    }

    /// Drop every pending reply sender; their requests resolve to `Closed`.
    fn fail_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            debug!(device = %self.device.short(), count = pending.len(), "failing pending requests");
        }
    }

    async fn read_messages<R>(&self, reader: &mut R, events: &EventSender) -> Result<String>
    where
        R: AsyncRead + Unpin,
    {
        let device = self.device;
        loop {
            let (msg_type, payload) = read_frame(reader).await?;
            match msg_type {
                MessageType::Response => {
                    let resp = Response::decode(payload)?;
                    let reply = self.pending.lock().remove(&resp.id);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(resp.result.map_err(ErrorCode::to_error));
                        }
                        None => debug!(device = %device.short(), id = resp.id, "response for unknown request"),
                    }
                }
                MessageType::Request => {
                    let req = Request::decode(payload)?;
                    let (reply, rx) = oneshot::channel();
                    events
                        .send(ConnectionEvent::Request {
                            device,
                            request: req.block,
                            reply,
                        })
                        .await
                        .map_err(|_| anyhow::anyhow!("Event channel closed"))?;

                    // Answered whenever the model finishes; later requests are not held up
                    let outbox = self.outbox.clone();
                    let id = req.id;
                    tokio::spawn(async move {
                        let result = rx.await.unwrap_or(Err(RequestError::Closed));
                        let resp = Response {
                            id,
                            result: result.map_err(|e| ErrorCode::from(&e)),
                        };
                        let _ = outbox.send(Outbound::Frame(resp.encode()));
                    });
                }
                MessageType::ClusterConfig => {
                    let config = ClusterConfig::decode(payload)?;
                    events
                        .send(ConnectionEvent::ClusterConfig { device, config })
                        .await
                        .map_err(|_| anyhow::anyhow!("Event channel closed"))?;
                }
                MessageType::Index => {
                    let index = Index::decode(payload)?;
                    events
                        .send(ConnectionEvent::Index { device, index })
                        .await
                        .map_err(|_| anyhow::anyhow!("Event channel closed"))?;
                }
                MessageType::Close => {
                    let close = Close::decode(payload)?;
                    return Ok(close.reason);
                }
                MessageType::Hello => anyhow::bail!("Unexpected HELLO after handshake"),
            }
        }
    }
}

async fn read_loop<R>(conn: Arc<FramedConnection>, mut reader: R, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let reason = match conn.read_messages(&mut reader, &events).await {
        Ok(reason) => reason,
        Err(e) => format!("{:#}", e),
    };

    if !conn.closed.swap(true, Ordering::SeqCst) {
        let _ = conn.outbox.send(Outbound::Shutdown);
    }
    conn.fail_pending();

    let _ = events
        .send(ConnectionEvent::Closed {
            device: conn.device,
            connection: conn.connection,
            reason,
        })
        .await;
}

async fn write_loop<W>(device: DeviceId, mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Frame(frame) => {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!(device = %device.short(), "write failed: {:#}", e);
                    return;
                }
                // Flush once the queue drains rather than per frame
                if rx.is_empty() {
                    if let Err(e) = writer.flush().await {
                        warn!(device = %device.short(), "flush failed: {}", e);
                        return;
                    }
                }
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

#[async_trait]
impl Connection for FramedConnection {
    fn id(&self) -> DeviceId {
        self.device
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    fn cluster_config(&self, config: ClusterConfig) {
        if self.send(config.encode()).is_err() {
            debug!(device = %self.device.short(), "cluster config on closed connection");
        }
    }

    fn index(&self, index: Index) -> Result<(), RequestError> {
        self.send(index.encode())
    }

    async fn request(&self, request: &BlockRequest) -> Result<Bytes, RequestError> {
        if self.is_closed() {
            return Err(RequestError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.pending.lock().insert(id, reply);

        // close() may have drained pending between the check and the insert
        if self.is_closed() {
            self.pending.lock().remove(&id);
            return Err(RequestError::Closed);
        }

        let frame = Request {
            id,
            block: request.clone(),
        }
        .encode();
        if self.outbox.send(Outbound::Frame(frame)).is_err() {
            self.pending.lock().remove(&id);
            return Err(RequestError::Closed);
        }

        rx.await.unwrap_or(Err(RequestError::Closed))
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(device = %self.device.short(), reason, "closing connection");

        let close = Close {
            reason: reason.to_string(),
        };
        let _ = self.outbox.send(Outbound::Frame(close.encode()));
        let _ = self.outbox.send(Outbound::Shutdown);
        self.fail_pending();

        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}
