//! Field encoder over a growable header buffer.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::{pad_len, to_ascii_lossy, MAX_ENDPOINT};
use crate::error::{EnsembleError, Result};
use crate::protocol::WireFormat;
use crate::view::{Endpoint, ViewId};

/// Default initial header buffer capacity.
pub const DEFAULT_ENCODER_CAPACITY: usize = 512;

/// Appends encoded fields to a reusable buffer.
///
/// The buffer grows by doubling and can be shrunk back with
/// [`Encoder::shrink_above`] once a large frame has been flushed.
#[derive(Debug)]
pub struct Encoder {
    buf: BytesMut,
    format: WireFormat,
}

impl Encoder {
    /// Create an encoder with the default capacity.
    pub fn new(format: WireFormat) -> Self {
        Self::with_capacity(format, DEFAULT_ENCODER_CAPACITY)
    }

    /// Create an encoder with a custom initial capacity.
    pub fn with_capacity(format: WireFormat, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity.max(1)),
            format,
        }
    }

    /// Wire format this encoder writes.
    #[inline]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Number of bytes written since the last clear.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current buffer capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Encoded bytes so far.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Reset the write cursor, keeping the allocation.
    #[inline]
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the encoded bytes, leaving the encoder empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Replace the buffer with a `low`-sized one if capacity exceeds `high_water`.
    ///
    /// Returns true if the buffer was shrunk.
    pub fn shrink_above(&mut self, high_water: usize, low: usize) -> bool {
        if self.buf.capacity() <= high_water {
            return false;
        }
        self.buf = BytesMut::with_capacity(low);
        true
    }

    fn grow_for(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        let mut size = self.buf.capacity().max(1);
        if needed <= size {
            return;
        }
        while size < needed {
            size *= 2;
        }
        self.buf.reserve(size - self.buf.len());
    }

    /// Write an int (big endian).
    pub fn put_int(&mut self, v: i32) {
        self.grow_for(4);
        self.buf.put_i32(v);
    }

    /// Write a bool as int `0` / `1`.
    pub fn put_bool(&mut self, b: bool) {
        self.put_int(i32::from(b));
    }

    /// Write a non-negative count or rank.
    pub fn put_count(&mut self, field: &'static str, n: usize) -> Result<()> {
        let v = i32::try_from(n).map_err(|_| EnsembleError::TooLarge {
            field,
            max: i32::MAX as usize,
            got: n,
        })?;
        self.put_int(v);
        Ok(())
    }

    /// Write a length-prefixed byte buffer, padded in the spawned format.
    pub fn put_buffer(&mut self, field: &'static str, data: &[u8], max: usize) -> Result<()> {
        if data.len() > max {
            return Err(EnsembleError::TooLarge {
                field,
                max,
                got: data.len(),
            });
        }
        let pad = if self.format.pads_buffers() {
            pad_len(data.len())
        } else {
            0
        };
        self.grow_for(4 + data.len() + pad);
        self.buf.put_i32(data.len() as i32);
        self.buf.put_slice(data);
        self.buf.put_bytes(0, pad);
        Ok(())
    }

    /// Write a string as ASCII, replacing anything else with `?`.
    pub fn put_string(&mut self, field: &'static str, s: &str, max: usize) -> Result<()> {
        self.put_buffer(field, &to_ascii_lossy(s), max)
    }

    /// Write an endpoint identifier.
    pub fn put_endpoint(&mut self, endpt: &Endpoint) -> Result<()> {
        self.put_string("endpoint", endpt.as_str(), MAX_ENDPOINT)
    }

    /// Write a view identifier: logical time then coordinator endpoint.
    pub fn put_view_id(&mut self, id: &ViewId) -> Result<()> {
        self.put_int(id.ltime);
        self.put_endpoint(&id.coord)
    }

    /// Write a time value.
    ///
    /// The socket format splits it into tens of seconds and tens of
    /// microseconds, the spawned format sends whole milliseconds.
    pub fn put_time(&mut self, time: Duration) {
        match self.format {
            WireFormat::Socket => {
                let micros = time.as_micros();
                let sec10 = micros / 10_000_000;
                let usec10 = (micros % 10_000_000) / 10;
                self.put_int(i32::try_from(sec10).unwrap_or(i32::MAX));
                self.put_int(usec10 as i32);
            }
            WireFormat::Spawned => {
                self.put_int(i32::try_from(time.as_millis()).unwrap_or(i32::MAX));
            }
        }
    }

    /// Write a count followed by each element.
    pub fn put_array<T>(
        &mut self,
        items: &[T],
        mut put: impl FnMut(&mut Self, &T) -> Result<()>,
    ) -> Result<()> {
        self.put_count("array", items.len())?;
        for item in items {
            put(self, item)?;
        }
        Ok(())
    }

    /// Write an inline message the way the spawned helper sends it upward:
    /// rounded size, actual size, body, padding.
    pub fn put_sized_message(&mut self, data: &[u8], max: usize) -> Result<()> {
        if data.len() > max {
            return Err(EnsembleError::TooLarge {
                field: "message",
                max,
                got: data.len(),
            });
        }
        let pad = pad_len(data.len());
        self.grow_for(8 + data.len() + pad);
        self.buf.put_i32(((data.len() + 7) & !3) as i32);
        self.buf.put_i32(data.len() as i32);
        self.buf.put_slice(data);
        self.buf.put_bytes(0, pad);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MAX_GROUP_NAME, MAX_MESSAGE};

    #[test]
    fn test_int_big_endian() {
        let mut enc = Encoder::new(WireFormat::Socket);
        enc.put_int(0x0102_0304);
        enc.put_int(-1);
        assert_eq!(enc.as_slice(), &[1, 2, 3, 4, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_bool_as_int() {
        let mut enc = Encoder::new(WireFormat::Socket);
        enc.put_bool(true);
        enc.put_bool(false);
        assert_eq!(enc.as_slice(), &[0, 0, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_buffer_unpadded_in_socket_format() {
        let mut enc = Encoder::new(WireFormat::Socket);
        enc.put_buffer("data", b"abcde", 16).unwrap();
        assert_eq!(enc.as_slice(), &[0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e']);
    }

    #[test]
    fn test_buffer_padded_in_spawned_format() {
        let mut enc = Encoder::new(WireFormat::Spawned);
        enc.put_buffer("data", b"abcde", 16).unwrap();
        assert_eq!(
            enc.as_slice(),
            &[0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e', 0, 0, 0]
        );
    }

    #[test]
    fn test_string_over_ceiling_rejected() {
        let mut enc = Encoder::new(WireFormat::Socket);
        let name = "g".repeat(MAX_GROUP_NAME + 1);
        let err = enc.put_string("group", &name, MAX_GROUP_NAME).unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::TooLarge { field: "group", max: 64, got: 65 }
        ));
        assert!(enc.is_empty());
    }

    #[test]
    fn test_socket_time_split() {
        let mut enc = Encoder::new(WireFormat::Socket);
        enc.put_time(Duration::from_millis(12_500));
        // 1 x 10s, 2.5s = 250_000 x 10us
        let mut expected = Vec::new();
        expected.extend_from_slice(&1i32.to_be_bytes());
        expected.extend_from_slice(&250_000i32.to_be_bytes());
        assert_eq!(enc.as_slice(), &expected[..]);
    }

    #[test]
    fn test_spawned_time_millis() {
        let mut enc = Encoder::new(WireFormat::Spawned);
        enc.put_time(Duration::from_millis(1500));
        assert_eq!(enc.as_slice(), &1500i32.to_be_bytes());
    }

    #[test]
    fn test_growth_doubles() {
        let mut enc = Encoder::with_capacity(WireFormat::Socket, 8);
        for i in 0..5 {
            enc.put_int(i);
        }
        assert_eq!(enc.len(), 20);
        assert!(enc.capacity() >= 20);
    }

    #[test]
    fn test_shrink_above_high_water() {
        let mut enc = Encoder::with_capacity(WireFormat::Socket, 512);
        enc.put_buffer("message", &vec![0u8; MAX_MESSAGE], MAX_MESSAGE)
            .unwrap();
        enc.put_buffer("message", &vec![0u8; MAX_MESSAGE], MAX_MESSAGE)
            .unwrap();
        enc.put_buffer("message", &vec![0u8; MAX_MESSAGE], MAX_MESSAGE)
            .unwrap();
        assert!(enc.capacity() > 64 * 1024);

        enc.clear();
        assert!(enc.shrink_above(64 * 1024, 4096));
        assert!(enc.capacity() < 64 * 1024);
        assert!(!enc.shrink_above(64 * 1024, 4096));
    }

    #[test]
    fn test_sized_message_layout() {
        let mut enc = Encoder::new(WireFormat::Spawned);
        enc.put_sized_message(b"ping", MAX_MESSAGE).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&8i32.to_be_bytes());
        expected.extend_from_slice(&4i32.to_be_bytes());
        expected.extend_from_slice(b"ping");
        assert_eq!(enc.as_slice(), &expected[..]);
    }

    #[test]
    fn test_take_empties_encoder() {
        let mut enc = Encoder::new(WireFormat::Socket);
        enc.put_int(1);
        let bytes = enc.take();
        assert_eq!(bytes.len(), 4);
        assert!(enc.is_empty());
    }
}
