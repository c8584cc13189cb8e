//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy frame extraction. Implements a state
//! machine for handling fragmented frames:
//! - `WaitingForPrecursor`: need the 4 or 8 length bytes
//! - `WaitingForBody`: precursor parsed, need N more bytes
//!
//! # Example
//!
//! ```ignore
//! use ensemble_client::protocol::{FrameBuffer, WireFormat, DEFAULT_MAX_HEADER_SIZE};
//!
//! let mut buffer = FrameBuffer::new(WireFormat::Socket, DEFAULT_MAX_HEADER_SIZE);
//!
//! // Data arrives in chunks from the socket
//! buffer.extend(&chunk);
//! while let Some(frame) = buffer.next_frame()? {
//!     println!("Got frame with {} header bytes", frame.header.len());
//! }
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Precursor, WireFormat};
use super::Frame;
use crate::error::Result;

/// Default read buffer capacity.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete precursor.
    WaitingForPrecursor,
    /// Precursor parsed and consumed, waiting for the body.
    WaitingForBody(Precursor),
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from stream reads.
    buffer: BytesMut,
    state: State,
    format: WireFormat,
    /// Maximum allowed header section size.
    max_header: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default capacity.
    pub fn new(format: WireFormat, max_header: usize) -> Self {
        Self::with_capacity(format, max_header, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Create a new frame buffer with a custom initial capacity.
    pub fn with_capacity(format: WireFormat, max_header: usize, capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForPrecursor,
            format,
            max_header,
        }
    }

    /// Append data to the buffer without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Push data and extract all complete frames.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Report whether a complete frame is buffered, without consuming it.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the buffered precursor is invalid.
    pub fn has_frame(&self) -> Result<bool> {
        let precursor = match self.state {
            State::WaitingForBody(p) => p,
            State::WaitingForPrecursor => {
                match Precursor::decode(self.format, &self.buffer, self.max_header)? {
                    Some(p) => {
                        let total = self.format.precursor_len() + p.body_len();
                        return Ok(self.buffer.len() >= total);
                    }
                    None => return Ok(false),
                }
            }
        };
        Ok(self.buffer.len() >= precursor.body_len())
    }

    /// Extract the next complete frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a malformed or oversized precursor
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.state {
            State::WaitingForPrecursor => {
                let precursor =
                    match Precursor::decode(self.format, &self.buffer, self.max_header)? {
                        Some(p) => p,
                        None => return Ok(None),
                    };

                let _ = self.buffer.split_to(self.format.precursor_len());
                self.state = State::WaitingForBody(precursor);
                self.next_frame()
            }

            State::WaitingForBody(precursor) => {
                if self.buffer.len() < precursor.body_len() {
                    return Ok(None);
                }

                let header = self.buffer.split_to(precursor.header_len).freeze();
                let data = if precursor.data_len > 0 {
                    self.buffer.split_to(precursor.data_len).freeze()
                } else {
                    Bytes::new()
                };

                self.state = State::WaitingForPrecursor;
                Ok(Some(Frame::new(header, data)))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True if no partial frame is pending.
    pub fn at_boundary(&self) -> bool {
        matches!(self.state, State::WaitingForPrecursor) && self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrecursor;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForPrecursor => "WaitingForPrecursor",
            State::WaitingForBody(_) => "WaitingForBody",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MAX_MESSAGE;
    use crate::protocol::{build_frame, DEFAULT_MAX_HEADER_SIZE};

    fn socket_buffer() -> FrameBuffer {
        FrameBuffer::new(WireFormat::Socket, DEFAULT_MAX_HEADER_SIZE)
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = socket_buffer();
        let bytes = build_frame(WireFormat::Socket, &[0, 0, 0, 1], b"hello");

        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].header[..], &[0, 0, 0, 1]);
        assert_eq!(&frames[0].data[..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = socket_buffer();
        let mut combined = Vec::new();
        for i in 1u8..=3 {
            combined.extend(build_frame(WireFormat::Socket, &[0, 0, 0, i], b""));
        }

        let frames = buffer.push(&combined).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].header[3], 3);
        assert!(buffer.at_boundary());
    }

    #[test]
    fn test_fragmented_precursor() {
        let mut buffer = socket_buffer();
        let bytes = build_frame(WireFormat::Socket, &[0, 0, 0, 7], b"test");

        buffer.extend(&bytes[..5]);
        assert!(!buffer.has_frame().unwrap());
        assert!(buffer.next_frame().unwrap().is_none());
        assert_eq!(buffer.state_name(), "WaitingForPrecursor");

        buffer.extend(&bytes[5..10]);
        assert!(buffer.next_frame().unwrap().is_none());
        assert_eq!(buffer.state_name(), "WaitingForBody");
        assert!(!buffer.has_frame().unwrap());

        buffer.extend(&bytes[10..]);
        assert!(buffer.has_frame().unwrap());
        let frame = buffer.next_frame().unwrap().unwrap();
        assert_eq!(&frame.data[..], b"test");
    }

    #[test]
    fn test_has_frame_does_not_consume() {
        let mut buffer = socket_buffer();
        buffer.extend(&build_frame(WireFormat::Socket, &[1, 2, 3, 4], b""));
        assert!(buffer.has_frame().unwrap());
        assert!(buffer.has_frame().unwrap());
        assert_eq!(buffer.len(), 12);
        assert!(buffer.next_frame().unwrap().is_some());
        assert!(!buffer.has_frame().unwrap());
    }

    #[test]
    fn test_spawned_single_length() {
        let mut buffer = FrameBuffer::new(WireFormat::Spawned, DEFAULT_MAX_HEADER_SIZE);
        let body = [0u8, 0, 0, 2, 0, 0, 0, 5];
        let frames = buffer
            .push(&build_frame(WireFormat::Spawned, &body, &[]))
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].header[..], &body);
        assert!(frames[0].data.is_empty());
    }

    #[test]
    fn test_data_over_max_rejected() {
        let mut buffer = socket_buffer();
        let mut precursor = vec![0, 0, 0, 4];
        precursor.extend_from_slice(&((MAX_MESSAGE + 1) as i32).to_be_bytes());

        let result = buffer.push(&precursor);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header_over_max_rejected() {
        let mut buffer = FrameBuffer::new(WireFormat::Socket, 16);
        let bytes = build_frame(WireFormat::Socket, &[0u8; 32], b"");
        assert!(buffer.has_frame().is_ok());
        buffer.extend(&bytes);
        assert!(buffer.has_frame().is_err());
        assert!(buffer.next_frame().is_err());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = socket_buffer();
        let bytes = build_frame(WireFormat::Socket, &[0, 0, 0, 1, 0, 0, 0, 2], b"hi");

        let mut all_frames = Vec::new();
        for byte in &bytes {
            all_frames.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(&all_frames[0].data[..], b"hi");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = socket_buffer();
        let bytes = build_frame(WireFormat::Socket, &[0, 0, 0, 1], b"test");
        buffer.push(&bytes[..10]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForBody");

        buffer.clear();

        assert_eq!(buffer.state_name(), "WaitingForPrecursor");
        assert!(buffer.at_boundary());
    }
}
