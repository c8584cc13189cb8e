//! Wire format strategies, opcodes and the frame precursor.
//!
//! Two wire formats share one codec and one state machine:
//!
//! ```text
//! Socket:   ┌────────────┬──────────┬────────────────┬───────────────┐
//!           │ header len │ data len │ header section │ bulk data     │
//!           │ int32 BE   │ int32 BE │ id, op, fields │ raw payload   │
//!           └────────────┴──────────┴────────────────┴───────────────┘
//!
//! Spawned:  ┌────────────┬──────────────────────────────────────────┐
//!           │ total len  │ id, [ltime], op, fields, inline payload  │
//!           │ int32 BE   │ buffers padded to 4 bytes                │
//!           └────────────┴──────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::MAX_MESSAGE;
use crate::error::{EnsembleError, Result};

/// Largest precursor across formats.
pub const MAX_PRECURSOR_SIZE: usize = 8;

/// Default ceiling for a frame's header section.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Frame layout spoken on the engine stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Direct TCP socket to the engine: two-length precursor, bulk payload
    /// after the header, unpadded buffers.
    #[default]
    Socket,
    /// Locally spawned helper over stdio: one-length precursor, inline
    /// payload, 4-byte padded buffers, logical time in downcall headers.
    Spawned,
}

impl WireFormat {
    /// Precursor size in bytes.
    #[inline]
    pub fn precursor_len(self) -> usize {
        match self {
            WireFormat::Socket => 8,
            WireFormat::Spawned => 4,
        }
    }

    /// Whether byte buffers are padded to a 4-byte boundary.
    #[inline]
    pub fn pads_buffers(self) -> bool {
        matches!(self, WireFormat::Spawned)
    }

    /// Whether message payloads travel in a separate bulk section.
    #[inline]
    pub fn separates_bulk(self) -> bool {
        matches!(self, WireFormat::Socket)
    }

    /// Whether downcall headers carry the member's logical time.
    #[inline]
    pub fn header_has_ltime(self) -> bool {
        matches!(self, WireFormat::Spawned)
    }

    /// Largest frame body accepted with the given header ceiling.
    pub(crate) fn max_body(self, max_header: usize) -> usize {
        match self {
            WireFormat::Socket => max_header,
            // inline payload plus its two size fields and padding
            WireFormat::Spawned => max_header + MAX_MESSAGE + 12,
        }
    }

    fn downcalls(self) -> &'static [DowncallKind; 12] {
        match self {
            WireFormat::Socket => &SOCKET_DOWNCALLS,
            WireFormat::Spawned => &SPAWNED_DOWNCALLS,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Socket => f.write_str("socket"),
            WireFormat::Spawned => f.write_str("spawned"),
        }
    }
}

/// Downcall types, independent of their per-format opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DowncallKind {
    Join,
    Cast,
    Send,
    Send1,
    SendBlocked,
    Suspect,
    XferDone,
    Protocol,
    Properties,
    Leave,
    Prompt,
    Rekey,
    BlockOk,
}

const SOCKET_DOWNCALLS: [DowncallKind; 12] = [
    DowncallKind::Join,
    DowncallKind::Cast,
    DowncallKind::Send,
    DowncallKind::Send1,
    DowncallKind::Suspect,
    DowncallKind::XferDone,
    DowncallKind::Protocol,
    DowncallKind::Properties,
    DowncallKind::Leave,
    DowncallKind::Prompt,
    DowncallKind::Rekey,
    DowncallKind::BlockOk,
];

const SPAWNED_DOWNCALLS: [DowncallKind; 12] = [
    DowncallKind::Join,
    DowncallKind::Cast,
    DowncallKind::SendBlocked,
    DowncallKind::Suspect,
    DowncallKind::XferDone,
    DowncallKind::Protocol,
    DowncallKind::Properties,
    DowncallKind::Leave,
    DowncallKind::Prompt,
    DowncallKind::Rekey,
    DowncallKind::BlockOk,
    DowncallKind::Send1,
];

impl DowncallKind {
    /// Opcode in the given format, or `None` if the format has no such downcall.
    pub fn opcode(self, format: WireFormat) -> Option<i32> {
        format
            .downcalls()
            .iter()
            .position(|k| *k == self)
            .map(|i| i as i32)
    }

    /// Downcall for an opcode in the given format.
    pub fn from_opcode(format: WireFormat, opcode: i32) -> Option<Self> {
        usize::try_from(opcode)
            .ok()
            .and_then(|i| format.downcalls().get(i).copied())
    }

    /// Operation name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            DowncallKind::Join => "join",
            DowncallKind::Cast => "cast",
            DowncallKind::Send => "send",
            DowncallKind::Send1 => "send1",
            DowncallKind::SendBlocked => "send_blocked",
            DowncallKind::Suspect => "suspect",
            DowncallKind::XferDone => "xfer_done",
            DowncallKind::Protocol => "change_protocol",
            DowncallKind::Properties => "change_properties",
            DowncallKind::Leave => "leave",
            DowncallKind::Prompt => "prompt",
            DowncallKind::Rekey => "rekey",
            DowncallKind::BlockOk => "block_ok",
        }
    }
}

/// Upcall types. Opcodes are the same in both formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum UpcallKind {
    View = 0,
    Cast = 1,
    Send = 2,
    Heartbeat = 3,
    Block = 4,
    Exit = 5,
}

impl UpcallKind {
    /// Upcall for an opcode.
    pub fn from_opcode(opcode: i32) -> Result<Self> {
        Ok(match opcode {
            0 => UpcallKind::View,
            1 => UpcallKind::Cast,
            2 => UpcallKind::Send,
            3 => UpcallKind::Heartbeat,
            4 => UpcallKind::Block,
            5 => UpcallKind::Exit,
            other => {
                return Err(EnsembleError::protocol(format!(
                    "Unknown upcall type {}",
                    other
                )))
            }
        })
    }

    #[inline]
    pub fn opcode(self) -> i32 {
        self as i32
    }
}

/// Length fields preceding every frame.
///
/// In the spawned format `data_len` is always zero and `header_len` is the
/// total body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precursor {
    pub header_len: usize,
    pub data_len: usize,
}

impl Precursor {
    /// Encode into a fixed buffer, returning the number of bytes used.
    pub fn encode(&self, format: WireFormat) -> ([u8; MAX_PRECURSOR_SIZE], usize) {
        let mut buf = [0u8; MAX_PRECURSOR_SIZE];
        match format {
            WireFormat::Socket => {
                buf[0..4].copy_from_slice(&(self.header_len as i32).to_be_bytes());
                buf[4..8].copy_from_slice(&(self.data_len as i32).to_be_bytes());
            }
            WireFormat::Spawned => {
                let total = self.header_len + self.data_len;
                buf[0..4].copy_from_slice(&(total as i32).to_be_bytes());
            }
        }
        (buf, format.precursor_len())
    }

    /// Decode and validate a precursor.
    ///
    /// Returns `Ok(None)` if `buf` is shorter than the precursor.
    pub fn decode(format: WireFormat, buf: &[u8], max_header: usize) -> Result<Option<Self>> {
        if buf.len() < format.precursor_len() {
            return Ok(None);
        }
        let first = read_len(&buf[0..4], "header")?;
        let precursor = match format {
            WireFormat::Socket => Self {
                header_len: first,
                data_len: read_len(&buf[4..8], "data")?,
            },
            WireFormat::Spawned => Self {
                header_len: first,
                data_len: 0,
            },
        };

        let max_body = format.max_body(max_header);
        if precursor.header_len > max_body {
            return Err(EnsembleError::protocol(format!(
                "Header size {} exceeds maximum {}",
                precursor.header_len, max_body
            )));
        }
        if precursor.data_len > MAX_MESSAGE {
            return Err(EnsembleError::protocol(format!(
                "Data size {} exceeds maximum {}",
                precursor.data_len, MAX_MESSAGE
            )));
        }
        Ok(Some(precursor))
    }

    /// Bytes that follow the precursor.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.header_len + self.data_len
    }
}

fn read_len(bytes: &[u8], what: &str) -> Result<usize> {
    let v = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    usize::try_from(v)
        .map_err(|_| EnsembleError::protocol(format!("Negative {} length {}", what, v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_opcodes() {
        let f = WireFormat::Socket;
        assert_eq!(DowncallKind::Join.opcode(f), Some(0));
        assert_eq!(DowncallKind::Send1.opcode(f), Some(3));
        assert_eq!(DowncallKind::Leave.opcode(f), Some(8));
        assert_eq!(DowncallKind::BlockOk.opcode(f), Some(11));
        assert_eq!(DowncallKind::SendBlocked.opcode(f), None);
    }

    #[test]
    fn test_spawned_opcodes() {
        let f = WireFormat::Spawned;
        assert_eq!(DowncallKind::SendBlocked.opcode(f), Some(2));
        assert_eq!(DowncallKind::Suspect.opcode(f), Some(3));
        assert_eq!(DowncallKind::BlockOk.opcode(f), Some(10));
        assert_eq!(DowncallKind::Send1.opcode(f), Some(11));
        assert_eq!(DowncallKind::Send.opcode(f), None);
    }

    #[test]
    fn test_opcode_table_inverse() {
        for format in [WireFormat::Socket, WireFormat::Spawned] {
            for op in 0..12 {
                let kind = DowncallKind::from_opcode(format, op).unwrap();
                assert_eq!(kind.opcode(format), Some(op));
            }
            assert_eq!(DowncallKind::from_opcode(format, 12), None);
            assert_eq!(DowncallKind::from_opcode(format, -1), None);
        }
    }

    #[test]
    fn test_upcall_opcodes() {
        assert_eq!(UpcallKind::from_opcode(0).unwrap(), UpcallKind::View);
        assert_eq!(UpcallKind::from_opcode(5).unwrap(), UpcallKind::Exit);
        assert_eq!(UpcallKind::Heartbeat.opcode(), 3);
        assert!(matches!(
            UpcallKind::from_opcode(6),
            Err(EnsembleError::Protocol(_))
        ));
    }

    #[test]
    fn test_precursor_socket() {
        let p = Precursor {
            header_len: 12,
            data_len: 4,
        };
        let (buf, n) = p.encode(WireFormat::Socket);
        assert_eq!(n, 8);
        assert_eq!(&buf[..n], &[0, 0, 0, 12, 0, 0, 0, 4]);
        let decoded = Precursor::decode(WireFormat::Socket, &buf[..n], DEFAULT_MAX_HEADER_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn test_precursor_spawned_total() {
        let p = Precursor {
            header_len: 20,
            data_len: 0,
        };
        let (buf, n) = p.encode(WireFormat::Spawned);
        assert_eq!(&buf[..n], &[0, 0, 0, 20]);
    }

    #[test]
    fn test_precursor_incomplete() {
        assert!(Precursor::decode(WireFormat::Socket, &[0, 0, 0, 1], 1024)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_precursor_negative_rejected() {
        let buf = (-1i32).to_be_bytes();
        assert!(Precursor::decode(WireFormat::Spawned, &buf, 1024).is_err());
    }

    #[test]
    fn test_precursor_data_over_max() {
        let mut buf = [0u8; 8];
        buf[4..8].copy_from_slice(&((MAX_MESSAGE + 1) as i32).to_be_bytes());
        let err = Precursor::decode(WireFormat::Socket, &buf, 1024).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_precursor_header_over_max() {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&2048i32.to_be_bytes());
        assert!(Precursor::decode(WireFormat::Socket, &buf, 1024).is_err());
    }
}
