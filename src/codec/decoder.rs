//! Field decoder over a received frame.
//!
//! Every getter checks that enough bytes remain and that lengths stay within
//! their ceilings. Failures are protocol errors: the stream can no longer be
//! trusted once a frame does not parse.

use std::time::Duration;

use bytes::{Buf, Bytes};

use super::{pad_len, INT_SIZE, MAX_ENDPOINT};
use crate::error::{EnsembleError, Result};
use crate::protocol::WireFormat;
use crate::view::{Endpoint, ViewId};

/// Reads encoded fields from a frame section.
#[derive(Debug, Clone)]
pub struct Decoder {
    buf: Bytes,
    declared: usize,
    format: WireFormat,
}

impl Decoder {
    /// Create a decoder over a complete frame section.
    pub fn new(buf: Bytes, format: WireFormat) -> Self {
        Self {
            declared: buf.len(),
            buf,
            format,
        }
    }

    /// Wire format this decoder reads.
    #[inline]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.declared - self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(EnsembleError::protocol(format!(
                "Truncated {}: need {} bytes at offset {}, {} left",
                what,
                n,
                self.position(),
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Read an int (big endian).
    pub fn get_int(&mut self) -> Result<i32> {
        self.need(INT_SIZE, "int")?;
        Ok(self.buf.get_i32())
    }

    /// Read a bool. Any non-zero value is true.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_int()? != 0)
    }

    /// Read a non-negative count, rank or length no larger than `max`.
    pub fn get_count(&mut self, field: &str, max: usize) -> Result<usize> {
        let v = self.get_int()?;
        let n = usize::try_from(v)
            .map_err(|_| EnsembleError::protocol(format!("Negative {}: {}", field, v)))?;
        if n > max {
            return Err(EnsembleError::protocol(format!(
                "{} {} exceeds maximum {}",
                field, n, max
            )));
        }
        Ok(n)
    }

    fn get_raw(&mut self, len: usize, what: &str) -> Result<Bytes> {
        self.need(len, what)?;
        Ok(self.buf.split_to(len))
    }

    fn skip_pad(&mut self, len: usize, what: &str) -> Result<()> {
        let pad = pad_len(len);
        if pad > 0 {
            self.need(pad, what)?;
            self.buf.advance(pad);
        }
        Ok(())
    }

    /// Read a length-prefixed byte buffer of at most `max` bytes.
    pub fn get_buffer(&mut self, field: &str, max: usize) -> Result<Bytes> {
        let len = self.get_count(field, max)?;
        let data = self.get_raw(len, field)?;
        if self.format.pads_buffers() {
            self.skip_pad(len, field)?;
        }
        Ok(data)
    }

    /// Read an ASCII string of at most `max` bytes.
    ///
    /// Bytes outside ASCII are replaced with `?`.
    pub fn get_string(&mut self, field: &str, max: usize) -> Result<String> {
        let raw = self.get_buffer(field, max)?;
        Ok(raw
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { '?' })
            .collect())
    }

    /// Read an endpoint identifier.
    pub fn get_endpoint(&mut self) -> Result<Endpoint> {
        Ok(Endpoint::new(self.get_string("endpoint", MAX_ENDPOINT)?))
    }

    /// Read a view identifier.
    pub fn get_view_id(&mut self) -> Result<ViewId> {
        let ltime = self.get_int()?;
        let coord = self.get_endpoint()?;
        Ok(ViewId { ltime, coord })
    }

    /// Read a time value (see [`super::Encoder::put_time`]).
    pub fn get_time(&mut self) -> Result<Duration> {
        match self.format {
            WireFormat::Socket => {
                let sec10 = self.get_count("time", i32::MAX as usize)? as u64;
                let usec10 = self.get_count("time", i32::MAX as usize)? as u64;
                Ok(Duration::from_secs(sec10 * 10) + Duration::from_micros(usec10 * 10))
            }
            WireFormat::Spawned => {
                let ms = self.get_count("time", i32::MAX as usize)? as u64;
                Ok(Duration::from_millis(ms))
            }
        }
    }

    /// Read a count followed by that many elements.
    ///
    /// Every element occupies at least one int, which bounds the count by
    /// the bytes left in the frame before anything is allocated.
    pub fn get_array<T>(
        &mut self,
        field: &str,
        max: Option<usize>,
        mut get: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let limit = max.unwrap_or(self.buf.remaining() / INT_SIZE);
        let count = self.get_count(field, limit)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(get(self)?);
        }
        Ok(items)
    }

    /// Read an inline message as the spawned helper sends it upward:
    /// rounded size, actual size, body, padding.
    pub fn get_sized_message(&mut self, max: usize) -> Result<Bytes> {
        let _rounded = self.get_int()?;
        let len = self.get_count("message", max)?;
        let data = self.get_raw(len, "message")?;
        self.skip_pad(len, "message")?;
        Ok(data)
    }

    /// Check that the whole section was consumed.
    pub fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(EnsembleError::protocol(format!(
                "Frame not fully consumed: read {} of {} bytes",
                self.position(),
                self.declared
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Encoder, MAX_DESTINATIONS, MAX_GROUP_NAME, MAX_MESSAGE};

    fn roundtrip(format: WireFormat, build: impl FnOnce(&mut Encoder)) -> Decoder {
        let mut enc = Encoder::new(format);
        build(&mut enc);
        Decoder::new(enc.take(), format)
    }

    #[test]
    fn test_primitives_roundtrip_both_formats() {
        for format in [WireFormat::Socket, WireFormat::Spawned] {
            let mut dec = roundtrip(format, |enc| {
                enc.put_int(i32::MIN);
                enc.put_bool(true);
                enc.put_string("group", "abc", MAX_GROUP_NAME).unwrap();
                enc.put_buffer("key", &[9u8; 32], 32).unwrap();
                enc.put_view_id(&ViewId::new(17, "coord:1")).unwrap();
                enc.put_time(Duration::from_millis(2_340));
            });
            assert_eq!(dec.get_int().unwrap(), i32::MIN);
            assert!(dec.get_bool().unwrap());
            assert_eq!(dec.get_string("group", MAX_GROUP_NAME).unwrap(), "abc");
            assert_eq!(&dec.get_buffer("key", 32).unwrap()[..], &[9u8; 32]);
            assert_eq!(dec.get_view_id().unwrap(), ViewId::new(17, "coord:1"));
            assert_eq!(dec.get_time().unwrap(), Duration::from_millis(2_340));
            dec.finish().unwrap();
        }
    }

    #[test]
    fn test_empty_string_roundtrip() {
        let mut dec = roundtrip(WireFormat::Spawned, |enc| {
            enc.put_string("params", "", 8).unwrap();
        });
        assert_eq!(dec.get_string("params", 8).unwrap(), "");
        dec.finish().unwrap();
    }

    #[test]
    fn test_array_roundtrip() {
        let ranks = vec![0usize, 3, 1];
        let mut dec = roundtrip(WireFormat::Socket, |enc| {
            enc.put_array(&ranks, |e, r| e.put_count("rank", *r)).unwrap();
        });
        let got = dec
            .get_array("dests", Some(MAX_DESTINATIONS), |d| {
                d.get_count("rank", usize::MAX)
            })
            .unwrap();
        assert_eq!(got, ranks);
    }

    #[test]
    fn test_string_over_ceiling_is_protocol_error() {
        let mut dec = roundtrip(WireFormat::Socket, |enc| {
            enc.put_string("group", &"x".repeat(65), 100).unwrap();
        });
        let err = dec.get_string("group", MAX_GROUP_NAME).unwrap_err();
        assert!(matches!(err, EnsembleError::Protocol(_)));
    }

    #[test]
    fn test_message_at_ceiling_roundtrips() {
        let body = vec![0xabu8; MAX_MESSAGE];
        let mut dec = roundtrip(WireFormat::Spawned, |enc| {
            enc.put_sized_message(&body, MAX_MESSAGE).unwrap();
        });
        assert_eq!(dec.get_sized_message(MAX_MESSAGE).unwrap().len(), MAX_MESSAGE);
        dec.finish().unwrap();
    }

    #[test]
    fn test_sized_message_padding_skipped() {
        let mut dec = roundtrip(WireFormat::Spawned, |enc| {
            enc.put_sized_message(b"hello", MAX_MESSAGE).unwrap();
            enc.put_int(42);
        });
        assert_eq!(&dec.get_sized_message(MAX_MESSAGE).unwrap()[..], b"hello");
        assert_eq!(dec.get_int().unwrap(), 42);
        dec.finish().unwrap();
    }

    #[test]
    fn test_truncated_int() {
        let mut dec = Decoder::new(Bytes::from_static(&[0, 0, 1]), WireFormat::Socket);
        assert!(matches!(dec.get_int(), Err(EnsembleError::Protocol(_))));
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut dec = roundtrip(WireFormat::Socket, |enc| enc.put_int(-5));
        assert!(matches!(
            dec.get_buffer("data", 10),
            Err(EnsembleError::Protocol(_))
        ));
    }

    #[test]
    fn test_array_count_bounded_by_frame() {
        let mut dec = roundtrip(WireFormat::Socket, |enc| {
            enc.put_int(1_000_000);
            enc.put_int(0);
        });
        let err = dec
            .get_array("members", None, |d| d.get_endpoint())
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Protocol(_)));
    }

    #[test]
    fn test_finish_detects_leftover() {
        let mut dec = roundtrip(WireFormat::Socket, |enc| {
            enc.put_int(1);
            enc.put_int(2);
        });
        dec.get_int().unwrap();
        let err = dec.finish().unwrap_err();
        assert!(err.to_string().contains("read 4 of 8"));
    }
}
