//! Downcalls: requests from the client into the engine.
//!
//! [`Downcall::encode`] writes the header (member id, optional logical
//! time, opcode) and the opcode-specific fields, and hands back the bulk
//! payload for formats that send it after the header.
//! [`DowncallFrame::decode`] is the engine-side inverse.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{DowncallKind, Frame, WireFormat};
use crate::codec::{
    Decoder, Encoder, KEY_SIZE, MAX_DESTINATIONS, MAX_GROUP_NAME, MAX_MESSAGE, MAX_PARAMS,
    MAX_PRINCIPAL, MAX_PROPERTIES, MAX_PROTOCOL, MAX_TRANSPORTS,
};
use crate::error::{EnsembleError, Result};
use crate::member::MemberId;
use crate::view::Endpoint;

/// Default transport list.
pub const DEFAULT_TRANSPORTS: &str = "DEERING";

/// Default property list used to build the protocol stack.
pub const DEFAULT_PROPERTIES: &str = "Gmp:Switch:Sync:Heal:Frag:Suspect:Flow:Slander";

/// Default heartbeat rate.
pub const DEFAULT_HEARTBEAT_RATE: Duration = Duration::from_secs(10);

/// Options sent with a join request.
///
/// Can be loaded from JSON; missing fields take their defaults.
///
/// ```
/// use ensemble_client::JoinOps;
///
/// let ops: JoinOps = serde_json::from_str(r#"{"group_name": "chat"}"#).unwrap();
/// assert_eq!(ops.group_name, "chat");
/// assert!(ops.use_properties);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinOps {
    /// Group to join. Required.
    pub group_name: String,
    /// How often the engine delivers heartbeat upcalls.
    #[serde(with = "millis")]
    pub heartbeat_rate: Duration,
    /// Requested transports.
    pub transports: String,
    /// Explicit protocol stack, used when `use_properties` is false.
    pub protocol: String,
    /// Properties the stack should provide.
    pub properties: String,
    pub use_properties: bool,
    /// Use the group daemon.
    pub groupd: bool,
    /// Group parameters.
    pub params: String,
    /// Join as a client member.
    pub client: bool,
    pub debug: bool,
    pub principal: String,
    /// Group key, exactly 32 bytes if present.
    pub key: Option<Vec<u8>>,
    pub secure: bool,
}

impl Default for JoinOps {
    fn default() -> Self {
        Self {
            group_name: String::new(),
            heartbeat_rate: DEFAULT_HEARTBEAT_RATE,
            transports: DEFAULT_TRANSPORTS.to_string(),
            protocol: String::new(),
            properties: DEFAULT_PROPERTIES.to_string(),
            use_properties: true,
            groupd: false,
            params: String::new(),
            client: false,
            debug: false,
            principal: String::new(),
            key: None,
            secure: false,
        }
    }
}

impl JoinOps {
    /// Join options for a group with everything else defaulted.
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            ..Self::default()
        }
    }

    /// Check the options that are not covered by field ceilings.
    pub fn validate(&self) -> Result<()> {
        if self.group_name.is_empty() {
            return Err(EnsembleError::InvalidArgument(
                "group name must not be empty".into(),
            ));
        }
        if let Some(key) = &self.key {
            if key.len() != KEY_SIZE {
                return Err(EnsembleError::InvalidArgument(format!(
                    "key must be {} bytes, got {}",
                    KEY_SIZE,
                    key.len()
                )));
            }
        }
        Ok(())
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_time(self.heartbeat_rate);
        enc.put_string("transports", &self.transports, MAX_TRANSPORTS)?;
        enc.put_string("protocol", &self.protocol, MAX_PROTOCOL)?;
        enc.put_string("group", &self.group_name, MAX_GROUP_NAME)?;
        enc.put_string("properties", &self.properties, MAX_PROPERTIES)?;
        enc.put_bool(self.use_properties);
        enc.put_bool(self.groupd);
        enc.put_string("params", &self.params, MAX_PARAMS)?;
        enc.put_bool(self.client);
        enc.put_bool(self.debug);
        enc.put_string("principal", &self.principal, MAX_PRINCIPAL)?;
        enc.put_buffer("key", self.key.as_deref().unwrap_or_default(), KEY_SIZE)?;
        enc.put_bool(self.secure);
        Ok(())
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        let heartbeat_rate = dec.get_time()?;
        let transports = dec.get_string("transports", MAX_TRANSPORTS)?;
        let protocol = dec.get_string("protocol", MAX_PROTOCOL)?;
        let group_name = dec.get_string("group", MAX_GROUP_NAME)?;
        let properties = dec.get_string("properties", MAX_PROPERTIES)?;
        let use_properties = dec.get_bool()?;
        let groupd = dec.get_bool()?;
        let params = dec.get_string("params", MAX_PARAMS)?;
        let client = dec.get_bool()?;
        let debug = dec.get_bool()?;
        let principal = dec.get_string("principal", MAX_PRINCIPAL)?;
        let key = dec.get_buffer("key", KEY_SIZE)?;
        let secure = dec.get_bool()?;
        Ok(Self {
            group_name,
            heartbeat_rate,
            transports,
            protocol,
            properties,
            use_properties,
            groupd,
            params,
            client,
            debug,
            principal,
            key: (!key.is_empty()).then(|| key.to_vec()),
            secure,
        })
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A single downcall with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downcall {
    Join(JoinOps),
    /// Multicast to the whole group.
    Cast(Bytes),
    /// Point-to-point to several ranks (socket format).
    Send { dests: Vec<usize>, data: Bytes },
    /// Point-to-point to one rank.
    Send1 { dest: usize, data: Bytes },
    /// Point-to-point by endpoint while blocked (spawned format).
    SendBlocked { dest: Endpoint, data: Bytes },
    /// Report ranks as failure-suspected (socket format).
    Suspect(Vec<usize>),
    /// Report endpoints as failure-suspected (spawned format).
    SuspectEndpoints(Vec<Endpoint>),
    XferDone,
    ChangeProtocol(String),
    ChangeProperties(String),
    Leave,
    Prompt,
    Rekey,
    BlockOk,
}

impl Downcall {
    /// Downcall type.
    pub fn kind(&self) -> DowncallKind {
        match self {
            Downcall::Join(_) => DowncallKind::Join,
            Downcall::Cast(_) => DowncallKind::Cast,
            Downcall::Send { .. } => DowncallKind::Send,
            Downcall::Send1 { .. } => DowncallKind::Send1,
            Downcall::SendBlocked { .. } => DowncallKind::SendBlocked,
            Downcall::Suspect(_) | Downcall::SuspectEndpoints(_) => DowncallKind::Suspect,
            Downcall::XferDone => DowncallKind::XferDone,
            Downcall::ChangeProtocol(_) => DowncallKind::Protocol,
            Downcall::ChangeProperties(_) => DowncallKind::Properties,
            Downcall::Leave => DowncallKind::Leave,
            Downcall::Prompt => DowncallKind::Prompt,
            Downcall::Rekey => DowncallKind::Rekey,
            Downcall::BlockOk => DowncallKind::BlockOk,
        }
    }

    /// Encode header and fields, returning the bulk payload (empty unless
    /// the format separates it).
    ///
    /// Fails without side effects beyond `enc` if the downcall has no
    /// encoding in the encoder's format or a field exceeds its ceiling.
    pub fn encode(&self, enc: &mut Encoder, member: MemberId, ltime: i32) -> Result<Bytes> {
        let format = enc.format();
        let kind = self.kind();
        let opcode = kind.opcode(format).ok_or(EnsembleError::Unsupported {
            op: kind.name(),
            format,
        })?;
        match (self, format) {
            (Downcall::Suspect(_), WireFormat::Spawned)
            | (Downcall::SuspectEndpoints(_), WireFormat::Socket) => {
                return Err(EnsembleError::Unsupported {
                    op: kind.name(),
                    format,
                })
            }
            _ => {}
        }

        enc.put_count("member id", member as usize)?;
        if format.header_has_ltime() {
            enc.put_int(ltime);
        }
        enc.put_int(opcode);

        let mut bulk = Bytes::new();
        match self {
            Downcall::Join(ops) => ops.encode(enc)?,
            Downcall::Cast(data) => bulk = put_payload(enc, data)?,
            Downcall::Send { dests, data } => {
                put_list(enc, dests, |e, r| e.put_count("rank", *r))?;
                bulk = put_payload(enc, data)?;
            }
            Downcall::Send1 { dest, data } => {
                enc.put_count("rank", *dest)?;
                bulk = put_payload(enc, data)?;
            }
            Downcall::SendBlocked { dest, data } => {
                enc.put_endpoint(dest)?;
                bulk = put_payload(enc, data)?;
            }
            Downcall::Suspect(ranks) => put_list(enc, ranks, |e, r| e.put_count("rank", *r))?,
            Downcall::SuspectEndpoints(endpts) => put_list(enc, endpts, |e, ep| e.put_endpoint(ep))?,
            Downcall::ChangeProtocol(proto) => enc.put_string("protocol", proto, MAX_PROTOCOL)?,
            Downcall::ChangeProperties(props) => {
                enc.put_string("properties", props, MAX_PROPERTIES)?
            }
            Downcall::XferDone
            | Downcall::Leave
            | Downcall::Prompt
            | Downcall::Rekey
            | Downcall::BlockOk => {}
        }
        Ok(bulk)
    }

    fn decode_body(kind: DowncallKind, dec: &mut Decoder, data: &Bytes) -> Result<Self> {
        let format = dec.format();
        Ok(match kind {
            DowncallKind::Join => Downcall::Join(JoinOps::decode(dec)?),
            DowncallKind::Cast => Downcall::Cast(get_payload(dec, data)?),
            DowncallKind::Send => {
                let dests = get_ranks(dec)?;
                Downcall::Send {
                    dests,
                    data: get_payload(dec, data)?,
                }
            }
            DowncallKind::Send1 => {
                let dest = dec.get_count("rank", i32::MAX as usize)?;
                Downcall::Send1 {
                    dest,
                    data: get_payload(dec, data)?,
                }
            }
            DowncallKind::SendBlocked => {
                let dest = dec.get_endpoint()?;
                Downcall::SendBlocked {
                    dest,
                    data: get_payload(dec, data)?,
                }
            }
            DowncallKind::Suspect => match format {
                WireFormat::Socket => Downcall::Suspect(get_ranks(dec)?),
                WireFormat::Spawned => Downcall::SuspectEndpoints(dec.get_array(
                    "suspects",
                    Some(MAX_DESTINATIONS),
                    Decoder::get_endpoint,
                )?),
            },
            DowncallKind::XferDone => Downcall::XferDone,
            DowncallKind::Protocol => {
                Downcall::ChangeProtocol(dec.get_string("protocol", MAX_PROTOCOL)?)
            }
            DowncallKind::Properties => {
                Downcall::ChangeProperties(dec.get_string("properties", MAX_PROPERTIES)?)
            }
            DowncallKind::Leave => Downcall::Leave,
            DowncallKind::Prompt => Downcall::Prompt,
            DowncallKind::Rekey => Downcall::Rekey,
            DowncallKind::BlockOk => Downcall::BlockOk,
        })
    }
}

fn put_list<T>(
    enc: &mut Encoder,
    items: &[T],
    put: impl FnMut(&mut Encoder, &T) -> Result<()>,
) -> Result<()> {
    if items.len() > MAX_DESTINATIONS {
        return Err(EnsembleError::TooLarge {
            field: "destinations",
            max: MAX_DESTINATIONS,
            got: items.len(),
        });
    }
    enc.put_array(items, put)
}

fn put_payload(enc: &mut Encoder, data: &Bytes) -> Result<Bytes> {
    if data.len() > MAX_MESSAGE {
        return Err(EnsembleError::TooLarge {
            field: "message",
            max: MAX_MESSAGE,
            got: data.len(),
        });
    }
    if enc.format().separates_bulk() {
        return Ok(data.clone());
    }
    enc.put_buffer("message", data, MAX_MESSAGE)?;
    Ok(Bytes::new())
}

fn get_payload(dec: &mut Decoder, data: &Bytes) -> Result<Bytes> {
    if dec.format().separates_bulk() {
        return Ok(data.clone());
    }
    dec.get_buffer("message", MAX_MESSAGE)
}

fn get_ranks(dec: &mut Decoder) -> Result<Vec<usize>> {
    dec.get_array("destinations", Some(MAX_DESTINATIONS), |d| {
        d.get_count("rank", i32::MAX as usize)
    })
}

/// A decoded downcall frame, as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowncallFrame {
    pub member: MemberId,
    /// Logical time from the header (always 0 in the socket format).
    pub ltime: i32,
    pub downcall: Downcall,
}

impl DowncallFrame {
    /// Decode a complete downcall frame.
    pub fn decode(frame: &Frame, format: WireFormat) -> Result<Self> {
        let mut dec = frame.decoder(format);
        let member = dec.get_count("member id", i32::MAX as usize)? as MemberId;
        let ltime = if format.header_has_ltime() {
            dec.get_int()?
        } else {
            0
        };
        let opcode = dec.get_int()?;
        let kind = DowncallKind::from_opcode(format, opcode).ok_or_else(|| {
            EnsembleError::protocol(format!("Unknown downcall type {}", opcode))
        })?;
        let downcall = Downcall::decode_body(kind, &mut dec, &frame.data)?;
        dec.finish()?;
        Ok(Self {
            member,
            ltime,
            downcall,
        })
    }
}
