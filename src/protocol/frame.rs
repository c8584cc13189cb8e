//! Frame struct and whole-frame builders.
//!
//! A frame is the unit read from and written to the engine stream: a header
//! section decoded field by field, plus an optional bulk data section
//! (socket format only).
//!
//! # Example
//!
//! ```
//! use ensemble_client::protocol::{build_frame, WireFormat};
//!
//! let header = [0u8, 0, 0, 1, 0, 0, 0, 1];
//! let bytes = build_frame(WireFormat::Socket, &header, b"ping");
//! assert_eq!(&bytes[..8], &[0, 0, 0, 8, 0, 0, 0, 4]);
//! assert_eq!(bytes.len(), 8 + 8 + 4);
//! ```

use bytes::Bytes;

use super::wire_format::{Precursor, WireFormat};
use crate::codec::Decoder;

/// A complete frame as read off the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Header section (typed fields).
    pub header: Bytes,
    /// Bulk data section. Always empty in the spawned format.
    pub data: Bytes,
}

impl Frame {
    /// Create a new frame from its sections.
    pub fn new(header: Bytes, data: Bytes) -> Self {
        Self { header, data }
    }

    /// Decoder positioned at the start of the header section.
    #[inline]
    pub fn decoder(&self, format: WireFormat) -> Decoder {
        Decoder::new(self.header.clone(), format)
    }

    /// Total length on the wire, precursor included.
    #[inline]
    pub fn wire_len(&self, format: WireFormat) -> usize {
        format.precursor_len() + self.header.len() + self.data.len()
    }

    /// Serialize the whole frame.
    pub fn to_bytes(&self, format: WireFormat) -> Vec<u8> {
        build_frame(format, &self.header, &self.data)
    }
}

/// Build a complete frame (precursor + header + data) into a new buffer.
///
/// In the spawned format `data` is appended to the body and counted in the
/// single length field.
pub fn build_frame(format: WireFormat, header: &[u8], data: &[u8]) -> Vec<u8> {
    let precursor = Precursor {
        header_len: header.len(),
        data_len: data.len(),
    };
    let (pre, n) = precursor.encode(format);
    let mut out = Vec::with_capacity(n + header.len() + data.len());
    out.extend_from_slice(&pre[..n]);
    out.extend_from_slice(header);
    out.extend_from_slice(data);
    out
}
