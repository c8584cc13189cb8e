//! Codec module - primitive field encoding for the engine protocol.
//!
//! Every field on the wire is built from a handful of primitives:
//!
//! - **int**: 4 bytes, big endian
//! - **bool**: int `0` / `1`
//! - **buffer**: int length + raw bytes (+ zero padding to 4 bytes in the
//!   spawned format)
//! - **string**: buffer of ASCII bytes
//! - **array**: int count + elements
//!
//! [`Encoder`] appends fields to a growable header buffer, [`Decoder`] reads
//! them back from a received frame and enforces the per-field ceilings below.
//!
//! # Example
//!
//! ```
//! use ensemble_client::codec::{Decoder, Encoder, MAX_GROUP_NAME};
//! use ensemble_client::protocol::WireFormat;
//!
//! let mut enc = Encoder::new(WireFormat::Socket);
//! enc.put_int(7);
//! enc.put_string("group", "chat", MAX_GROUP_NAME).unwrap();
//!
//! let mut dec = Decoder::new(enc.take(), WireFormat::Socket);
//! assert_eq!(dec.get_int().unwrap(), 7);
//! assert_eq!(dec.get_string("group", MAX_GROUP_NAME).unwrap(), "chat");
//! dec.finish().unwrap();
//! ```

mod decoder;
mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;

use std::borrow::Cow;

/// Size of an encoded int.
pub const INT_SIZE: usize = 4;

/// Maximum endpoint name length.
pub const MAX_ENDPOINT: usize = 48;
/// Maximum transport address length.
pub const MAX_ADDRESS: usize = 48;
/// Maximum member name length (endpoint plus a suffix).
pub const MAX_NAME: usize = MAX_ENDPOINT + 24;
/// Maximum version string length.
pub const MAX_VERSION: usize = 8;
/// Maximum group name length.
pub const MAX_GROUP_NAME: usize = 64;
/// Maximum protocol stack string length.
pub const MAX_PROTOCOL: usize = 256;
/// Maximum properties string length.
pub const MAX_PROPERTIES: usize = 128;
/// Maximum group parameters string length.
pub const MAX_PARAMS: usize = 256;
/// Maximum principal length.
pub const MAX_PRINCIPAL: usize = 32;
/// Maximum transports string length.
pub const MAX_TRANSPORTS: usize = 32;
/// Security keys are either absent or exactly this long.
pub const KEY_SIZE: usize = 32;
/// Maximum message payload (32 KiB).
pub const MAX_MESSAGE: usize = 32 * 1024;
/// Maximum entries in a destination or suspect list.
pub const MAX_DESTINATIONS: usize = 10;

/// Convert a string to the ASCII bytes the engine expects.
///
/// Each non-ASCII character becomes a single `?`. This is lossy by contract
/// and never an error.
pub fn to_ascii_lossy(s: &str) -> Cow<'_, [u8]> {
    if s.is_ascii() {
        return Cow::Borrowed(s.as_bytes());
    }
    Cow::Owned(
        s.chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect(),
    )
}

/// Number of zero bytes needed to pad `len` to a 4-byte boundary.
#[inline]
pub fn pad_len(len: usize) -> usize {
    (INT_SIZE - len % INT_SIZE) % INT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough_borrows() {
        let out = to_ascii_lossy("hello");
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&out[..], b"hello");
    }

    #[test]
    fn test_ascii_lossy_replacement() {
        assert_eq!(&to_ascii_lossy("zażółć")[..], b"za????");
        assert_eq!(&to_ascii_lossy("π=3")[..], b"?=3");
    }

    #[test]
    fn test_pad_len() {
        assert_eq!(pad_len(0), 0);
        assert_eq!(pad_len(1), 3);
        assert_eq!(pad_len(3), 1);
        assert_eq!(pad_len(4), 0);
        assert_eq!(pad_len(5), 3);
    }
}
