//! Data tokens: one payload plus its meta-data.
//!
//! A token's payload is a `BufferSet`: an ordered list of byte segments.
//! Segments are either borrowed (a zero-copy view of a buffer the producer
//! still owns) or owned (copied into memory the token controls). A token
//! that must outlive the producer's buffer has to be forced into owned
//! copies first.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::wire::WireError;

// ── Segments ──────────────────────────────────────────────────────────────────

/// One contiguous piece of a token's payload.
#[derive(Debug, Clone)]
pub struct Segment {
    data: Bytes,
    owned: bool,
}

impl Segment {
    /// Wrap a buffer without copying it.
    pub fn borrowed(data: Bytes) -> Self {
        Self { data, owned: false }
    }

    /// Copy `data` into a fresh allocation.
    pub fn copied(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
            owned: true,
        }
    }

    /// Adopt a buffer this process already owns (e.g. a received frame).
    pub fn adopted(data: Bytes) -> Self {
        Self { data, owned: true }
    }

    pub fn is_copy(&self) -> bool {
        self.owned
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ── BufferSet ─────────────────────────────────────────────────────────────────

/// Ordered binary segments making up one token.
#[derive(Debug, Clone, Default)]
pub struct BufferSet {
    segments: Vec<Segment>,
}

impl BufferSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn push_borrowed(&mut self, data: Bytes) {
        self.push(Segment::borrowed(data));
    }

    pub fn push_copy(&mut self, data: &[u8]) {
        self.push(Segment::copied(data));
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total payload bytes across all segments.
    pub fn byte_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// True if any segment still points at memory this set does not own.
    pub fn contains_non_copies(&self) -> bool {
        self.segments.iter().any(|s| !s.owned)
    }

    /// Replace every borrowed segment with an owned copy.
    pub fn force_copy(&mut self) {
        for segment in self.segments.iter_mut().filter(|s| !s.owned) {
            *segment = Segment::copied(&segment.data);
        }
    }

    /// Size of `encode_into` output.
    pub fn encoded_len(&self) -> usize {
        4 + self.segments.iter().map(|s| 4 + s.len()).sum::<usize>()
    }

    /// Append the binary form: `u32 LE count`, then `u32 LE len` + bytes
    /// per segment.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32_le(self.segments.len() as u32);
        for segment in &self.segments {
            buf.put_u32_le(segment.len() as u32);
            buf.put_slice(&segment.data);
        }
    }

    /// Parse the binary form. Segments are zero-copy slices of `bytes`,
    /// which belong to the receiver, so they count as owned.
    pub fn decode(mut bytes: Bytes) -> Result<Self, WireError> {
        if bytes.remaining() < 4 {
            return Err(WireError::Truncated("segment count"));
        }
        let count = bytes.get_u32_le() as usize;
        let mut segments = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            if bytes.remaining() < 4 {
                return Err(WireError::Truncated("segment length"));
            }
            let len = bytes.get_u32_le() as usize;
            if bytes.remaining() < len {
                return Err(WireError::Truncated("segment data"));
            }
            segments.push(Segment::adopted(bytes.split_to(len)));
        }
        if bytes.has_remaining() {
            return Err(WireError::TrailingBytes(bytes.remaining()));
        }
        Ok(Self { segments })
    }
}

impl PartialEq for BufferSet {
    /// Ownership is a storage detail; equality is over content only.
    fn eq(&self, other: &Self) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a.data == b.data)
    }
}

impl Eq for BufferSet {}

impl FromIterator<Segment> for BufferSet {
    fn from_iter<I: IntoIterator<Item = Segment>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().collect(),
        }
    }
}

// ── Meta-data ─────────────────────────────────────────────────────────────────

/// Acquisition time of a token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: u64,
    /// Sub-second part in attoseconds.
    pub fractional: u64,
    /// Machine train id, 0 if unknown.
    pub train_id: u64,
}

impl Timestamp {
    const ATTOS_PER_NANO: u64 = 1_000_000_000;

    pub fn now(train_id: u64) -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: elapsed.as_secs(),
            fractional: u64::from(elapsed.subsec_nanos()) * Self::ATTOS_PER_NANO,
            train_id,
        }
    }
}

/// Per-token description: where it came from and when.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    pub source: String,
    pub timestamp: Timestamp,
}

impl MetaData {
    pub fn new(source: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            source: source.into(),
            timestamp,
        }
    }
}

// ── Token ─────────────────────────────────────────────────────────────────────

/// One payload plus its meta-data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataToken {
    pub buffers: BufferSet,
    pub meta: MetaData,
}

impl DataToken {
    pub fn new(buffers: BufferSet, meta: MetaData) -> Self {
        Self { buffers, meta }
    }
}
