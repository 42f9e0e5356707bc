//! Sluice wire format: framing between output and input channels.
//!
//! Every frame is a fixed 12-byte `FramePrefix`, then `header_len` bytes of
//! JSON header document, then `payload_len` raw payload bytes. The prefix is
//! the only binary-layout type; it uses zerocopy derives so it can be read
//! and written without any unsafe code.
//!
//! Consumers send `Hello` once per connection and `Update` whenever they
//! are ready for the next chunk. Producers answer with `LocalChunk` (same
//! pool: only the handles travel), `Payload` (serialized tokens) or
//! `EndOfStream`. A `LocalChunk` stays held by the producer until an
//! `Update` lists it as released.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::data::{BufferSet, DataToken, MetaData};
use crate::handle::{ChannelId, ChunkId};
use crate::policy::{DataDistribution, MemoryLocation, SlownessPolicy};

// ── Frame prefix ──────────────────────────────────────────────────────────────

/// Fixed-size prefix in front of every frame.
///
/// Wire size: 12 bytes. Multi-byte fields are little-endian.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FramePrefix {
    /// Always `FRAME_MAGIC`. Anything else means the peer is not speaking
    /// this protocol and the connection is closed.
    pub magic: [u8; 2],
    /// Currently `FRAME_VERSION`.
    pub version: u8,
    /// One of `FrameKind`.
    pub kind: u8,
    /// Length of the JSON header document.
    pub header_len: U32<LittleEndian>,
    /// Length of the raw payload following the header.
    pub payload_len: U32<LittleEndian>,
}

assert_eq_size!(FramePrefix, [u8; 12]);

impl FramePrefix {
    pub fn new(kind: FrameKind, header_len: usize, payload_len: usize) -> Result<Self, WireError> {
        check_len(header_len, MAX_HEADER)?;
        check_len(payload_len, MAX_PAYLOAD)?;
        Ok(Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            kind: kind.into(),
            header_len: U32::new(header_len as u32),
            payload_len: U32::new(payload_len as u32),
        })
    }

    /// Parse and validate a received prefix. Lengths are bounded before the
    /// caller allocates anything for the rest of the frame.
    pub fn parse(bytes: &[u8; PREFIX_LEN]) -> Result<(FrameKind, usize, usize), WireError> {
        let prefix = FramePrefix::read_from(&bytes[..]).ok_or(WireError::Truncated("prefix"))?;
        if prefix.magic != FRAME_MAGIC {
            return Err(WireError::BadMagic(prefix.magic));
        }
        if prefix.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(prefix.version));
        }
        let kind = FrameKind::try_from(prefix.kind)?;
        let header_len = prefix.header_len.get() as usize;
        let payload_len = prefix.payload_len.get() as usize;
        check_len(header_len, MAX_HEADER)?;
        check_len(payload_len, MAX_PAYLOAD)?;
        Ok((kind, header_len, payload_len))
    }
}

fn check_len(len: usize, max: usize) -> Result<(), WireError> {
    if len > max {
        return Err(WireError::FrameTooLarge { len, max });
    }
    Ok(())
}

// ── Frame kind ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Consumer → producer, once per connection.
    Hello = 0x01,
    /// Consumer → producer, "ready for the next chunk".
    Update = 0x02,
    /// Producer → consumer, pool handles of a chunk in this process.
    LocalChunk = 0x03,
    /// Producer → consumer, serialized tokens.
    Payload = 0x04,
    /// Producer → consumer, the stream is finished.
    EndOfStream = 0x05,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Hello),
            0x02 => Ok(FrameKind::Update),
            0x03 => Ok(FrameKind::LocalChunk),
            0x04 => Ok(FrameKind::Payload),
            0x05 => Ok(FrameKind::EndOfStream),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Header documents ──────────────────────────────────────────────────────────

/// Messages a consumer sends to its producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "lowercase")]
pub enum ConsumerMessage {
    #[serde(rename_all = "camelCase")]
    Hello {
        instance_id: String,
        memory_location: MemoryLocation,
        data_distribution: DataDistribution,
        on_slowness: SlownessPolicy,
        /// The consumer's pool. Required for local delivery.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pool_id: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        instance_id: String,
        /// Local chunks the consumer is done with.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        released: Vec<LocalChunkRef>,
    },
}

impl ConsumerMessage {
    pub fn instance_id(&self) -> &str {
        match self {
            ConsumerMessage::Hello { instance_id, .. } => instance_id,
            ConsumerMessage::Update { instance_id, .. } => instance_id,
        }
    }

    fn kind(&self) -> FrameKind {
        match self {
            ConsumerMessage::Hello { .. } => FrameKind::Hello,
            ConsumerMessage::Update { .. } => FrameKind::Update,
        }
    }
}

/// Reference to a chunk in the producer's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalChunkRef {
    pub pool_id: u64,
    pub channel_id: ChannelId,
    pub chunk_id: ChunkId,
}

/// Describes a serialized chunk. `byte_sizes[i]` is the encoded length of
/// token `i`, so the payload can be split without parsing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadHeader {
    pub source_info: Vec<MetaData>,
    pub byte_sizes: Vec<u32>,
    /// Hex BLAKE3 of the payload.
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndOfStreamHeader {
    end_of_stream: bool,
}

// ── Frames ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Frame {
    Consumer(ConsumerMessage),
    LocalChunk(LocalChunkRef),
    Payload { header: PayloadHeader, payload: Bytes },
    EndOfStream,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Consumer(msg) => msg.kind(),
            Frame::LocalChunk(_) => FrameKind::LocalChunk,
            Frame::Payload { .. } => FrameKind::Payload,
            Frame::EndOfStream => FrameKind::EndOfStream,
        }
    }

    /// Split into prefix, header document and payload, ready to write.
    pub fn to_parts(&self) -> Result<(FramePrefix, Vec<u8>, Bytes), WireError> {
        let (header, payload) = match self {
            Frame::Consumer(msg) => (serde_json::to_vec(msg)?, Bytes::new()),
            Frame::LocalChunk(r) => (serde_json::to_vec(r)?, Bytes::new()),
            Frame::Payload { header, payload } => (serde_json::to_vec(header)?, payload.clone()),
            Frame::EndOfStream => (
                serde_json::to_vec(&EndOfStreamHeader { end_of_stream: true })?,
                Bytes::new(),
            ),
        };
        let prefix = FramePrefix::new(self.kind(), header.len(), payload.len())?;
        Ok((prefix, header, payload))
    }

    /// Rebuild a frame from its received parts.
    pub fn from_parts(kind: FrameKind, header: &[u8], payload: Bytes) -> Result<Self, WireError> {
        let frame = match kind {
            FrameKind::Hello | FrameKind::Update => {
                let msg: ConsumerMessage = serde_json::from_slice(header)?;
                if msg.kind() != kind {
                    return Err(WireError::KindMismatch {
                        prefix: kind,
                        header: msg.kind(),
                    });
                }
                Frame::Consumer(msg)
            }
            FrameKind::LocalChunk => Frame::LocalChunk(serde_json::from_slice(header)?),
            FrameKind::Payload => Frame::Payload {
                header: serde_json::from_slice(header)?,
                payload,
            },
            FrameKind::EndOfStream => {
                let _: EndOfStreamHeader = serde_json::from_slice(header)?;
                Frame::EndOfStream
            }
        };
        Ok(frame)
    }
}

// ── Token serialization ───────────────────────────────────────────────────────

/// A chunk's tokens in wire form. Built once per chunk and shared between
/// every remote consumer the chunk goes to.
#[derive(Debug, Clone)]
pub struct SerializedChunk {
    pub header: PayloadHeader,
    pub payload: Bytes,
}

impl SerializedChunk {
    pub fn to_frame(&self) -> Frame {
        Frame::Payload {
            header: self.header.clone(),
            payload: self.payload.clone(),
        }
    }
}

pub fn checksum(payload: &[u8]) -> String {
    hex::encode(blake3::hash(payload).as_bytes())
}

/// Serialize tokens into one payload. Fails up front if the payload would
/// not fit in a frame.
pub fn encode_tokens<'a, I>(tokens: I) -> Result<SerializedChunk, WireError>
where
    I: IntoIterator<Item = &'a DataToken>,
    I::IntoIter: Clone,
{
    let tokens = tokens.into_iter();
    let len: usize = tokens.clone().map(|t| t.buffers.encoded_len()).sum();
    check_len(len, MAX_PAYLOAD)?;

    let mut payload = BytesMut::with_capacity(len);
    let mut source_info = Vec::new();
    let mut byte_sizes = Vec::new();
    for token in tokens {
        let before = payload.len();
        token.buffers.encode_into(&mut payload);
        byte_sizes.push((payload.len() - before) as u32);
        source_info.push(token.meta.clone());
    }
    let payload = payload.freeze();
    Ok(SerializedChunk {
        header: PayloadHeader {
            source_info,
            byte_sizes,
            checksum: checksum(&payload),
        },
        payload,
    })
}

/// Verify and split a payload back into tokens. Segments are zero-copy
/// slices of `payload`.
pub fn decode_tokens(header: &PayloadHeader, mut payload: Bytes) -> Result<Vec<DataToken>, WireError> {
    if checksum(&payload) != header.checksum {
        return Err(WireError::ChecksumMismatch);
    }
    if header.source_info.len() != header.byte_sizes.len() {
        return Err(WireError::CountMismatch {
            buffers: header.byte_sizes.len(),
            metas: header.source_info.len(),
        });
    }
    let declared: usize = header.byte_sizes.iter().map(|&n| n as usize).sum();
    if declared != payload.len() {
        return Err(WireError::Truncated("payload"));
    }
    header
        .byte_sizes
        .iter()
        .zip(&header.source_info)
        .map(|(&size, meta)| {
            let buffers = BufferSet::decode(payload.split_to(size as usize))?;
            Ok(DataToken::new(buffers, meta.clone()))
        })
        .collect()
}

// ── Constants ─────────────────────────────────────────────────────────────────

pub const FRAME_MAGIC: [u8; 2] = *b"SL";

pub const FRAME_VERSION: u8 = 0x01;

pub const PREFIX_LEN: usize = 12;

/// Maximum JSON header size in bytes.
pub const MAX_HEADER: usize = 16 * 1024 * 1024;

/// Maximum payload size in bytes.
pub const MAX_PAYLOAD: usize = 1024 * 1024 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("frame section of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed header document: {0}")]
    Header(#[from] serde_json::Error),

    #[error("prefix says {prefix:?} but header says {header:?}")]
    KindMismatch { prefix: FrameKind, header: FrameKind },

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("{0} trailing bytes after last segment")]
    TrailingBytes(usize),

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error("{buffers} buffer sets but {metas} meta-data entries")]
    CountMismatch { buffers: usize, metas: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
