//! Upcalls: events delivered from the engine to a member.
//!
//! The dispatcher decodes an upcall in two steps, header first so the member
//! can be looked up, then the type-specific body. [`Event::encode`] is the
//! engine-side inverse, used by simulators and tests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::{Frame, UpcallKind, WireFormat};
use crate::codec::{Decoder, Encoder, MAX_MESSAGE};
use crate::error::{EnsembleError, Result};
use crate::member::MemberId;
use crate::view::View;

/// Decoded upcall payload. The tag decides which fields are meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new view was installed.
    View(Arc<View>),
    /// Multicast received from `origin`.
    Cast { origin: usize, data: Bytes },
    /// Point-to-point message received from `origin`.
    Send { origin: usize, data: Bytes },
    /// Periodic heartbeat carrying the engine's current time.
    Heartbeat(Duration),
    /// The engine asks the member to stop sending until the next view.
    Block,
    /// The member has left the group.
    Exit,
}

impl Event {
    /// Upcall type.
    pub fn kind(&self) -> UpcallKind {
        match self {
            Event::View(_) => UpcallKind::View,
            Event::Cast { .. } => UpcallKind::Cast,
            Event::Send { .. } => UpcallKind::Send,
            Event::Heartbeat(_) => UpcallKind::Heartbeat,
            Event::Block => UpcallKind::Block,
            Event::Exit => UpcallKind::Exit,
        }
    }

    /// Read the member id and upcall type.
    pub fn decode_header(dec: &mut Decoder) -> Result<(MemberId, UpcallKind)> {
        let id = dec.get_int()?;
        let member = MemberId::try_from(id)
            .map_err(|_| EnsembleError::protocol(format!("Bad member id {}", id)))?;
        let kind = UpcallKind::from_opcode(dec.get_int()?)?;
        Ok((member, kind))
    }

    /// Read the type-specific body. `data` is the frame's bulk section.
    pub fn decode_body(kind: UpcallKind, dec: &mut Decoder, data: &Bytes) -> Result<Self> {
        Ok(match kind {
            UpcallKind::View => Event::View(Arc::new(View::decode(dec)?)),
            UpcallKind::Cast => {
                let (origin, data) = decode_message(dec, data)?;
                Event::Cast { origin, data }
            }
            UpcallKind::Send => {
                let (origin, data) = decode_message(dec, data)?;
                Event::Send { origin, data }
            }
            UpcallKind::Heartbeat => Event::Heartbeat(dec.get_time()?),
            UpcallKind::Block => Event::Block,
            UpcallKind::Exit => Event::Exit,
        })
    }

    /// Encode header and body, returning the bulk payload.
    pub fn encode(&self, enc: &mut Encoder, member: MemberId) -> Result<Bytes> {
        enc.put_count("member id", member as usize)?;
        enc.put_int(self.kind().opcode());
        let mut bulk = Bytes::new();
        match self {
            Event::View(view) => view.encode(enc)?,
            Event::Cast { origin, data } | Event::Send { origin, data } => {
                enc.put_count("origin", *origin)?;
                if enc.format().separates_bulk() {
                    if data.len() > MAX_MESSAGE {
                        return Err(EnsembleError::TooLarge {
                            field: "message",
                            max: MAX_MESSAGE,
                            got: data.len(),
                        });
                    }
                    bulk = data.clone();
                } else {
                    enc.put_sized_message(data, MAX_MESSAGE)?;
                }
            }
            Event::Heartbeat(time) => enc.put_time(*time),
            Event::Block | Event::Exit => {}
        }
        Ok(bulk)
    }

    /// Encode as a complete frame.
    pub fn to_frame(&self, member: MemberId, format: WireFormat) -> Result<Frame> {
        let mut enc = Encoder::new(format);
        let bulk = self.encode(&mut enc, member)?;
        Ok(Frame::new(enc.take(), bulk))
    }
}

fn decode_message(dec: &mut Decoder, data: &Bytes) -> Result<(usize, Bytes)> {
    let origin = dec.get_count("origin", i32::MAX as usize)?;
    let payload = if dec.format().separates_bulk() {
        data.clone()
    } else {
        dec.get_sized_message(MAX_MESSAGE)?
    };
    Ok((origin, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::tests::make_view;

    fn roundtrip(event: Event, format: WireFormat) {
        let frame = event.to_frame(4, format).unwrap();
        let mut dec = frame.decoder(format);
        let (member, kind) = Event::decode_header(&mut dec).unwrap();
        assert_eq!(member, 4);
        assert_eq!(kind, event.kind());
        let decoded = Event::decode_body(kind, &mut dec, &frame.data).unwrap();
        dec.finish().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_upcalls_roundtrip_both_formats() {
        for format in [WireFormat::Socket, WireFormat::Spawned] {
            let view = make_view(format, &["a:1", "b:2"], 0, 3);
            roundtrip(Event::View(Arc::new(view)), format);
            roundtrip(
                Event::Cast {
                    origin: 1,
                    data: Bytes::from_static(b"hello"),
                },
                format,
            );
            roundtrip(
                Event::Send {
                    origin: 0,
                    data: Bytes::from_static(b"ping"),
                },
                format,
            );
            roundtrip(Event::Heartbeat(Duration::from_secs(30)), format);
            roundtrip(Event::Block, format);
            roundtrip(Event::Exit, format);
        }
    }

    #[test]
    fn test_socket_cast_uses_bulk_section() {
        let frame = Event::Cast {
            origin: 1,
            data: Bytes::from_static(b"xyz"),
        }
        .to_frame(2, WireFormat::Socket)
        .unwrap();
        assert_eq!(frame.header.len(), 12);
        assert_eq!(&frame.data[..], b"xyz");
    }

    #[test]
    fn test_unknown_upcall_type() {
        let mut enc = Encoder::new(WireFormat::Socket);
        enc.put_int(1);
        enc.put_int(9);
        let mut dec = Decoder::new(enc.take(), WireFormat::Socket);
        assert!(matches!(
            Event::decode_header(&mut dec),
            Err(EnsembleError::Protocol(_))
        ));
    }

    #[test]
    fn test_negative_member_id() {
        let mut enc = Encoder::new(WireFormat::Socket);
        enc.put_int(-3);
        enc.put_int(0);
        let mut dec = Decoder::new(enc.take(), WireFormat::Socket);
        assert!(Event::decode_header(&mut dec).is_err());
    }
}
