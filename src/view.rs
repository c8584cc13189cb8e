//! Group views and the identifiers they are built from.
//!
//! A [`View`] is immutable once decoded. The dispatcher hands it out as
//! `Arc<View>`, so a callback can keep an old view after a newer one has
//! been installed.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{
    Decoder, Encoder, KEY_SIZE, MAX_ADDRESS, MAX_GROUP_NAME, MAX_NAME, MAX_PARAMS, MAX_PROTOCOL,
    MAX_VERSION,
};
use crate::error::{EnsembleError, Result};
use crate::protocol::WireFormat;

/// Name of a group member's endpoint, as assigned by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    /// Wrap an endpoint name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Endpoint name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifies a view: logical time plus the coordinator that installed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewId {
    pub ltime: i32,
    pub coord: Endpoint,
}

impl ViewId {
    pub fn new(ltime: i32, coord: impl Into<String>) -> Self {
        Self {
            ltime,
            coord: Endpoint::new(coord),
        }
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.ltime, self.coord)
    }
}

/// Snapshot of group membership and configuration.
///
/// `members[rank]` is the local endpoint. Fields that the spawned wire format
/// does not carry (`addr`, `name`, `key`, `prev_ids`, `uptime`, `addresses`)
/// are left empty, and `clients` is empty in the socket format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct View {
    /// Engine version string.
    pub version: String,
    /// Group name.
    pub group: String,
    /// Protocol stack in use.
    pub proto: String,
    /// Group parameters.
    pub params: String,
    /// Local endpoint.
    pub endpt: Endpoint,
    /// Local transport address.
    pub addr: String,
    /// Local member name.
    pub name: String,
    /// Local rank in `members`.
    pub rank: usize,
    /// Coordinator rank in `members`.
    pub coord: usize,
    /// True if the local member coordinates this view.
    pub am_coord: bool,
    pub view_id: ViewId,
    /// Logical time of this view.
    pub ltime: i32,
    pub primary: bool,
    pub groupd: bool,
    /// True if this is a state-transfer view.
    pub xfer_view: bool,
    /// Group key, if the group is secure.
    pub key: Option<Bytes>,
    /// Ids of the views merged into this one.
    pub prev_ids: Vec<ViewId>,
    /// Time since the group was created.
    pub uptime: Duration,
    /// Member endpoints in rank order.
    pub members: Vec<Endpoint>,
    /// Transport addresses in rank order.
    pub addresses: Vec<String>,
    /// Per-member client flags (spawned format only).
    pub clients: Vec<bool>,
}

impl View {
    /// Number of members in the view.
    #[inline]
    pub fn nmembers(&self) -> usize {
        self.members.len()
    }

    /// Rank of an endpoint in this view.
    pub fn rank_of(&self, endpt: &Endpoint) -> Option<usize> {
        self.members.iter().position(|m| m == endpt)
    }

    /// Endpoint at a rank.
    pub fn endpoint(&self, rank: usize) -> Option<&Endpoint> {
        self.members.get(rank)
    }

    /// Decode a view upcall body in the decoder's wire format.
    pub fn decode(dec: &mut Decoder) -> Result<Self> {
        let view = match dec.format() {
            WireFormat::Socket => Self::decode_socket(dec)?,
            WireFormat::Spawned => Self::decode_spawned(dec)?,
        };
        view.validate()?;
        Ok(view)
    }

    fn decode_socket(dec: &mut Decoder) -> Result<Self> {
        let endpt = dec.get_endpoint()?;
        let addr = dec.get_string("address", MAX_ADDRESS)?;
        let rank = dec.get_count("rank", i32::MAX as usize)?;
        let name = dec.get_string("name", MAX_NAME)?;
        let nmembers = dec.get_count("nmembers", i32::MAX as usize)?;
        let view_id = dec.get_view_id()?;
        let am_coord = dec.get_bool()?;

        let version = dec.get_string("version", MAX_VERSION)?;
        let group = dec.get_string("group", MAX_GROUP_NAME)?;
        let proto = dec.get_string("protocol", MAX_PROTOCOL)?;
        let coord = dec.get_count("coord", i32::MAX as usize)?;
        let ltime = dec.get_int()?;
        let primary = dec.get_bool()?;
        let groupd = dec.get_bool()?;
        let xfer_view = dec.get_bool()?;
        let key = decode_key(dec)?;
        let prev_ids = dec.get_array("prev_ids", None, Decoder::get_view_id)?;
        let params = dec.get_string("params", MAX_PARAMS)?;
        let uptime = dec.get_time()?;
        let members = dec.get_array("members", None, Decoder::get_endpoint)?;
        let addresses = dec.get_array("addresses", None, |d| d.get_string("address", MAX_ADDRESS))?;

        if nmembers != members.len() {
            return Err(EnsembleError::protocol(format!(
                "View declares {} members but lists {}",
                nmembers,
                members.len()
            )));
        }

        Ok(Self {
            version,
            group,
            proto,
            params,
            endpt,
            addr,
            name,
            rank,
            coord,
            am_coord,
            view_id,
            ltime,
            primary,
            groupd,
            xfer_view,
            key,
            prev_ids,
            uptime,
            members,
            addresses,
            clients: Vec::new(),
        })
    }

    fn decode_spawned(dec: &mut Decoder) -> Result<Self> {
        let version = dec.get_string("version", MAX_VERSION)?;
        let group = dec.get_string("group", MAX_GROUP_NAME)?;
        let members = dec.get_array("members", None, Decoder::get_endpoint)?;
        let rank = dec.get_count("rank", i32::MAX as usize)?;
        let proto = dec.get_string("protocol", MAX_PROTOCOL)?;
        let groupd = dec.get_bool()?;
        let ltime = dec.get_int()?;
        let coord_endpt = dec.get_endpoint()?;
        let params = dec.get_string("params", MAX_PARAMS)?;
        let xfer_view = dec.get_bool()?;
        let primary = dec.get_bool()?;
        let clients = dec.get_array("clients", None, Decoder::get_bool)?;

        let endpt = members.get(rank).cloned().unwrap_or_default();
        let coord = members
            .iter()
            .position(|m| *m == coord_endpt)
            .ok_or_else(|| {
                EnsembleError::protocol(format!(
                    "View coordinator {} is not a member",
                    coord_endpt
                ))
            })?;

        Ok(Self {
            version,
            group,
            proto,
            params,
            am_coord: coord == rank,
            endpt,
            addr: String::new(),
            name: String::new(),
            rank,
            coord,
            view_id: ViewId {
                ltime,
                coord: coord_endpt,
            },
            ltime,
            primary,
            groupd,
            xfer_view,
            key: None,
            prev_ids: Vec::new(),
            uptime: Duration::ZERO,
            members,
            addresses: Vec::new(),
            clients,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.rank >= self.nmembers() {
            return Err(EnsembleError::protocol(format!(
                "View rank {} out of range for {} members",
                self.rank,
                self.nmembers()
            )));
        }
        if self.members[self.rank] != self.endpt {
            return Err(EnsembleError::protocol(format!(
                "View rank {} is {}, local endpoint is {}",
                self.rank, self.members[self.rank], self.endpt
            )));
        }
        Ok(())
    }

    /// Encode this view as an upcall body.
    ///
    /// This is the engine side of the protocol; the client only decodes
    /// views, but simulators and tests need to produce them.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match enc.format() {
            WireFormat::Socket => {
                enc.put_endpoint(&self.endpt)?;
                enc.put_string("address", &self.addr, MAX_ADDRESS)?;
                enc.put_count("rank", self.rank)?;
                enc.put_string("name", &self.name, MAX_NAME)?;
                enc.put_count("nmembers", self.nmembers())?;
                enc.put_view_id(&self.view_id)?;
                enc.put_bool(self.am_coord);

                enc.put_string("version", &self.version, MAX_VERSION)?;
                enc.put_string("group", &self.group, MAX_GROUP_NAME)?;
                enc.put_string("protocol", &self.proto, MAX_PROTOCOL)?;
                enc.put_count("coord", self.coord)?;
                enc.put_int(self.ltime);
                enc.put_bool(self.primary);
                enc.put_bool(self.groupd);
                enc.put_bool(self.xfer_view);
                enc.put_buffer("key", self.key.as_deref().unwrap_or_default(), KEY_SIZE)?;
                enc.put_array(&self.prev_ids, |e, id| e.put_view_id(id))?;
                enc.put_string("params", &self.params, MAX_PARAMS)?;
                enc.put_time(self.uptime);
                enc.put_array(&self.members, |e, m| e.put_endpoint(m))?;
                enc.put_array(&self.addresses, |e, a| {
                    e.put_string("address", a, MAX_ADDRESS)
                })?;
            }
            WireFormat::Spawned => {
                enc.put_string("version", &self.version, MAX_VERSION)?;
                enc.put_string("group", &self.group, MAX_GROUP_NAME)?;
                enc.put_array(&self.members, |e, m| e.put_endpoint(m))?;
                enc.put_count("rank", self.rank)?;
                enc.put_string("protocol", &self.proto, MAX_PROTOCOL)?;
                enc.put_bool(self.groupd);
                enc.put_int(self.view_id.ltime);
                enc.put_endpoint(&self.view_id.coord)?;
                enc.put_string("params", &self.params, MAX_PARAMS)?;
                enc.put_bool(self.xfer_view);
                enc.put_bool(self.primary);
                enc.put_array(&self.clients, |e, c| {
                    e.put_bool(*c);
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}

fn decode_key(dec: &mut Decoder) -> Result<Option<Bytes>> {
    let key = dec.get_buffer("key", KEY_SIZE)?;
    match key.len() {
        0 => Ok(None),
        KEY_SIZE => Ok(Some(key)),
        n => Err(EnsembleError::protocol(format!("Bad key size {}", n))),
    }
}
