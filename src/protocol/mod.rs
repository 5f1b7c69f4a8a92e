//! Peer protocol message types and framing.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8), byte strings u32 len.
//! Frame format: len:u32 | type:u8 | payload

pub mod features;

pub use features::{Features, FEATURES_KEY, FEATURES_VERSION};

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RequestError;
use crate::types::{BlockHash, BlockInfo, DeviceId, FileInfo, DEVICE_ID_LEN, HASH_LEN};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Encoded size of one block entry: hash + offset + size
const BLOCK_INFO_SIZE: usize = HASH_LEN + 8 + 4;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    ClusterConfig = 0x02,
    Index = 0x03,
    Request = 0x04,
    Response = 0x05,
    Close = 0x06,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::ClusterConfig),
            0x03 => Some(Self::Index),
            0x04 => Some(Self::Request),
            0x05 => Some(Self::Response),
            0x06 => Some(Self::Close),
            _ => None,
        }
    }
}

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IndexFlags: u32 {
        /// Provisional index of partially assembled files
        const TEMPORARY = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// Block is to be read from an in-progress staging file
        const TEMPORARY = 1 << 0;
    }
}

// =============================================================================
// Error Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NoSuchFile = 1,
    Invalid = 2,
    Closed = 3,
    IoError = 4,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::NoSuchFile),
            2 => Some(Self::Invalid),
            3 => Some(Self::Closed),
            4 => Some(Self::IoError),
            _ => None,
        }
    }

    pub fn to_error(self) -> RequestError {
        match self {
            ErrorCode::NoSuchFile => RequestError::NoSuchFile,
            ErrorCode::Invalid => RequestError::Invalid,
            ErrorCode::Closed => RequestError::Closed,
            ErrorCode::IoError => RequestError::from(std::io::Error::new(
                std::io::ErrorKind::Other,
                "remote i/o failure",
            )),
        }
    }
}

impl From<&RequestError> for ErrorCode {
    fn from(err: &RequestError) -> Self {
        match err {
            RequestError::NoSuchFile => ErrorCode::NoSuchFile,
            RequestError::Invalid => ErrorCode::Invalid,
            RequestError::Closed => ErrorCode::Closed,
            RequestError::Io(_) => ErrorCode::IoError,
        }
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn frame(msg_type: MessageType, payload: BytesMut) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.extend_from_slice(&payload);
    buf.freeze()
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length truncated", what);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        );
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .with_context(|| format!("Invalid UTF-8 in {}", what))
}

fn get_array<const N: usize>(payload: &mut Bytes, what: &str) -> Result<[u8; N]> {
    if payload.remaining() < N {
        anyhow::bail!("{} truncated", what);
    }
    let mut out = [0u8; N];
    payload.copy_to_slice(&mut out);
    Ok(out)
}

fn put_file(buf: &mut BytesMut, file: &FileInfo) {
    put_str(buf, &file.name);
    buf.put_u64(file.version);
    buf.put_u32(file.blocks.len() as u32);
    for block in &file.blocks {
        buf.put_slice(block.hash.as_bytes());
        buf.put_i64(block.offset);
        buf.put_u32(block.size);
    }
}

fn get_file(payload: &mut Bytes) -> Result<FileInfo> {
    let name = get_str(payload, "file name")?;
    if payload.remaining() < 12 {
        anyhow::bail!("FileInfo header truncated");
    }
    let version = payload.get_u64();
    let count = payload.get_u32() as usize;
    if payload.remaining() < count.saturating_mul(BLOCK_INFO_SIZE) {
        anyhow::bail!("FileInfo blocks truncated: {} blocks declared", count);
    }
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let hash = BlockHash::new(get_array::<HASH_LEN>(payload, "block hash")?);
        let offset = payload.get_i64();
        let size = payload.get_u32();
        blocks.push(BlockInfo { hash, offset, size });
    }
    Ok(FileInfo {
        name,
        version,
        blocks,
    })
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

/// First frame on every stream, sent by both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub device_id: DeviceId,
    pub client_name: String,
}

impl Hello {
    pub fn new(device_id: DeviceId, client_name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            device_id,
            client_name: client_name.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + DEVICE_ID_LEN + 2 + self.client_name.len());
        buf.put_u16(self.version);
        buf.put_slice(self.device_id.as_bytes());
        put_str(&mut buf, &self.client_name);
        frame(MessageType::Hello, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 + DEVICE_ID_LEN {
            anyhow::bail!("Hello payload too short");
        }
        let version = payload.get_u16();
        let device_id = DeviceId::new(get_array::<DEVICE_ID_LEN>(&mut payload, "device id")?);
        let client_name = get_str(&mut payload, "client name")?;
        Ok(Self {
            version,
            device_id,
            client_name,
        })
    }
}

// =============================================================================
// CLUSTER_CONFIG (0x02)
// =============================================================================

/// A `(key, value)` capability option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOption {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterConfig {
    pub client_name: String,
    pub client_version: String,
    pub options: Vec<ConfigOption>,
}

impl ClusterConfig {
    pub fn get_option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.key == key)
            .map(|o| o.value.as_str())
    }

    /// Advertised feature set; empty if the option is absent
    pub fn features(&self) -> Features {
        self.get_option(FEATURES_KEY)
            .map(Features::unmarshal)
            .unwrap_or_default()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.client_name);
        put_str(&mut buf, &self.client_version);
        buf.put_u16(self.options.len() as u16);
        for opt in &self.options {
            put_str(&mut buf, &opt.key);
            put_str(&mut buf, &opt.value);
        }
        frame(MessageType::ClusterConfig, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let client_name = get_str(&mut payload, "client name")?;
        let client_version = get_str(&mut payload, "client version")?;
        if payload.remaining() < 2 {
            anyhow::bail!("ClusterConfig option count truncated");
        }
        let count = payload.get_u16() as usize;
        let mut options = Vec::with_capacity(count);
        for _ in 0..count {
            let key = get_str(&mut payload, "option key")?;
            let value = get_str(&mut payload, "option value")?;
            options.push(ConfigOption { key, value });
        }
        Ok(Self {
            client_name,
            client_version,
            options,
        })
    }
}

// =============================================================================
// INDEX (0x03)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub folder: String,
    pub flags: IndexFlags,
    pub files: Vec<FileInfo>,
}

impl Index {
    pub fn is_temporary(&self) -> bool {
        self.flags.contains(IndexFlags::TEMPORARY)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.folder);
        buf.put_u32(self.flags.bits());
        buf.put_u32(self.files.len() as u32);
        for file in &self.files {
            put_file(&mut buf, file);
        }
        frame(MessageType::Index, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let folder = get_str(&mut payload, "folder")?;
        if payload.remaining() < 8 {
            anyhow::bail!("Index payload too short");
        }
        let flags = IndexFlags::from_bits_truncate(payload.get_u32());
        let count = payload.get_u32() as usize;
        // Each file needs at least its name length, version and block count
        let mut files = Vec::with_capacity(count.min(payload.remaining() / 14));
        for _ in 0..count {
            files.push(get_file(&mut payload)?);
        }
        Ok(Self {
            folder,
            flags,
            files,
        })
    }
}

// =============================================================================
// REQUEST (0x04)
// =============================================================================

/// A block read, as issued by a router and served by a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub folder: String,
    pub name: String,
    pub offset: i64,
    pub size: u32,
    pub hash: BlockHash,
    pub flags: RequestFlags,
}

impl BlockRequest {
    /// Request for `block` of `folder`/`name`
    pub fn for_block(folder: &str, name: &str, block: &BlockInfo, flags: RequestFlags) -> Self {
        Self {
            folder: folder.to_string(),
            name: name.to_string(),
            offset: block.offset,
            size: block.size,
            hash: block.hash,
            flags,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.flags.contains(RequestFlags::TEMPORARY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u32,
    pub block: BlockRequest,
}

impl Request {
    pub fn encode(&self) -> Bytes {
        let b = &self.block;
        let mut buf =
            BytesMut::with_capacity(4 + 2 + b.folder.len() + 2 + b.name.len() + 8 + 4 + HASH_LEN + 4);
        buf.put_u32(self.id);
        put_str(&mut buf, &b.folder);
        put_str(&mut buf, &b.name);
        buf.put_i64(b.offset);
        buf.put_u32(b.size);
        buf.put_slice(b.hash.as_bytes());
        buf.put_u32(b.flags.bits());
        frame(MessageType::Request, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            anyhow::bail!("Request payload too short");
        }
        let id = payload.get_u32();
        let folder = get_str(&mut payload, "folder")?;
        let name = get_str(&mut payload, "file name")?;
        if payload.remaining() < 8 + 4 + HASH_LEN + 4 {
            anyhow::bail!("Request payload truncated");
        }
        let offset = payload.get_i64();
        let size = payload.get_u32();
        let hash = BlockHash::new(get_array::<HASH_LEN>(&mut payload, "block hash")?);
        let flags = RequestFlags::from_bits_truncate(payload.get_u32());
        Ok(Self {
            id,
            block: BlockRequest {
                folder,
                name,
                offset,
                size,
                hash,
                flags,
            },
        })
    }
}

// =============================================================================
// RESPONSE (0x05)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Response {
    pub id: u32,
    pub result: std::result::Result<Bytes, ErrorCode>,
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let (code, data) = match &self.result {
            Ok(data) => (0u16, data.clone()),
            Err(code) => (*code as u16, Bytes::new()),
        };
        let mut buf = BytesMut::with_capacity(4 + 2 + 4 + data.len());
        buf.put_u32(self.id);
        buf.put_u16(code);
        buf.put_u32(data.len() as u32);
        buf.put_slice(&data);
        frame(MessageType::Response, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 10 {
            anyhow::bail!("Response payload too short");
        }
        let id = payload.get_u32();
        let code = payload.get_u16();
        let len = payload.get_u32() as usize;
        if payload.remaining() < len {
            anyhow::bail!(
                "Response data truncated: expected {} bytes, got {}",
                len,
                payload.remaining()
            );
        }
        let data = payload.copy_to_bytes(len);
        let result = match code {
            0 => Ok(data),
            // Unknown codes from newer peers read as a generic refusal
            c => Err(ErrorCode::from_u16(c).unwrap_or(ErrorCode::Invalid)),
        };
        Ok(Self { id, result })
    }
}

// =============================================================================
// CLOSE (0x06)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub reason: String,
}

impl Close {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        put_str(&mut buf, &self.reason);
        frame(MessageType::Close, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let reason = get_str(&mut payload, "close reason")?;
        Ok(Self { reason })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

/// Exchange HELLO frames and return the peer's.
pub async fn handshake<R, W>(reader: &mut R, writer: &mut W, ours: &Hello) -> Result<Hello>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &ours.encode()).await?;
    writer.flush().await?;

    let (msg_type, payload) = read_frame(reader).await?;
    if msg_type != MessageType::Hello {
        anyhow::bail!("Expected HELLO, got {:?}", msg_type);
    }
    let theirs = Hello::decode(payload)?;
    if theirs.version != PROTOCOL_VERSION {
        let close = Close {
            reason: format!("unsupported protocol version {}", theirs.version),
        };
        write_frame(writer, &close.encode()).await?;
        writer.flush().await?;
        anyhow::bail!(
            "Peer {} speaks protocol version {}, expected {}",
            theirs.device_id.short(),
            theirs.version,
            PROTOCOL_VERSION
        );
    }
    Ok(theirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(b: u8) -> DeviceId {
        DeviceId::new([b; DEVICE_ID_LEN])
    }

    fn file() -> FileInfo {
        FileInfo {
            name: "dir/file.bin".into(),
            version: 42,
            blocks: (0..3u8)
                .map(|i| BlockInfo {
                    hash: BlockHash::of(&[i]),
                    offset: i as i64 * 1024,
                    size: 1024,
                })
                .collect(),
        }
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello::new(dev(3), "blockshare");
        let encoded = hello.encode();
        assert_eq!(encoded[4], MessageType::Hello as u8);
        let decoded = Hello::decode(encoded.slice(5..)).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn test_index_roundtrip() {
        let index = Index {
            folder: "default".into(),
            flags: IndexFlags::TEMPORARY,
            files: vec![file(), FileInfo::default()],
        };
        let decoded = Index::decode(index.encode().slice(5..)).unwrap();
        assert!(decoded.is_temporary());
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_index_truncated() {
        let index = Index {
            folder: "default".into(),
            flags: IndexFlags::empty(),
            files: vec![file()],
        };
        let encoded = index.encode();
        let truncated = encoded.slice(5..encoded.len() - 10);
        assert!(Index::decode(truncated).is_err());
    }

    #[test]
    fn test_cluster_config_features() {
        let cc = ClusterConfig {
            client_name: "blockshare".into(),
            client_version: "0.1.0".into(),
            options: vec![ConfigOption {
                key: FEATURES_KEY.into(),
                value: Features::TEMPORARY_INDEX.marshal(),
            }],
        };
        let decoded = ClusterConfig::decode(cc.encode().slice(5..)).unwrap();
        assert_eq!(decoded, cc);
        assert!(decoded.features().contains(Features::TEMPORARY_INDEX));
        assert!(ClusterConfig::default().features().is_empty());
    }

    #[test]
    fn test_request_response() {
        let req = Request {
            id: 7,
            block: BlockRequest {
                folder: "x".into(),
                name: "file".into(),
                offset: 4096,
                size: 128,
                hash: BlockHash::of(b"data"),
                flags: RequestFlags::TEMPORARY,
            },
        };
        let decoded = Request::decode(req.encode().slice(5..)).unwrap();
        assert!(decoded.block.is_temporary());
        assert_eq!(decoded, req);

        let ok = Response {
            id: 7,
            result: Ok(Bytes::from_static(b"data")),
        };
        let decoded = Response::decode(ok.encode().slice(5..)).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.result.unwrap(), Bytes::from_static(b"data"));

        let err = Response {
            id: 8,
            result: Err(ErrorCode::NoSuchFile),
        };
        let decoded = Response::decode(err.encode().slice(5..)).unwrap();
        assert_eq!(decoded.result.unwrap_err(), ErrorCode::NoSuchFile);
    }

    #[test]
    fn test_error_code_mapping() {
        for err in [
            RequestError::NoSuchFile,
            RequestError::Invalid,
            RequestError::Closed,
        ] {
            let code = ErrorCode::from(&err);
            assert_eq!(ErrorCode::from_u16(code as u16), Some(code));
            assert_eq!(ErrorCode::from(&code.to_error()), code);
        }
        assert_eq!(ErrorCode::from_u16(0), None);
    }

    #[tokio::test]
    async fn test_frame_io() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let close = Close {
            reason: "bye".into(),
        };
        write_frame(&mut a, &close.encode()).await.unwrap();
        let (msg_type, payload) = read_frame(&mut b).await.unwrap();
        assert_eq!(msg_type, MessageType::Close);
        assert_eq!(Close::decode(payload).unwrap(), close);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(MAX_FRAME_SIZE + 1).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut cr, mut cw) = tokio::io::split(client);
        let (mut sr, mut sw) = tokio::io::split(server);

        let ours = Hello::new(dev(1), "a");
        let theirs = Hello::new(dev(2), "b");
        let (a, b) = tokio::join!(
            handshake(&mut cr, &mut cw, &ours),
            handshake(&mut sr, &mut sw, &theirs),
        );
        assert_eq!(a.unwrap().device_id, dev(2));
        assert_eq!(b.unwrap().device_id, dev(1));
    }

    #[tokio::test]
    async fn test_handshake_rejects_version() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut cr, mut cw) = tokio::io::split(client);
        let (mut sr, mut sw) = tokio::io::split(server);

        let mut old = Hello::new(dev(1), "old");
        old.version = 0;
        let theirs = Hello::new(dev(2), "b");
        let (a, b) = tokio::join!(
            handshake(&mut cr, &mut cw, &old),
            handshake(&mut sr, &mut sw, &theirs),
        );
        assert!(a.is_ok());
        assert!(b.is_err());
    }
}
