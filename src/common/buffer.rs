//! Packet buffers flowing through a Link

use bytes::Bytes;

use super::destination::Destination;

/// Largest payload a single buffer carries when a byte stream is chunked.
pub const BUFFER_SIZE: usize = 2048;

/// One unit of data on a Link.
///
/// Stream traffic leaves `endpoint` empty; packet traffic may carry the
/// remote endpoint the datagram came from or is headed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Bytes,
    pub endpoint: Option<Destination>,
}

impl Packet {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(payload: impl Into<Bytes>, endpoint: Destination) -> Self {
        Self {
            payload: payload.into(),
            endpoint: Some(endpoint),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A batch of packets moved in one read or write.
pub type MultiBuffer = Vec<Packet>;

/// Split a byte slice into buffers of at most [`BUFFER_SIZE`] bytes.
pub fn chunk(data: &[u8]) -> MultiBuffer {
    data.chunks(BUFFER_SIZE)
        .map(|c| Packet::new(Bytes::copy_from_slice(c)))
        .collect()
}

/// Total payload size of a batch.
pub fn total_len(mb: &[Packet]) -> usize {
    mb.iter().map(Packet::len).sum()
}
