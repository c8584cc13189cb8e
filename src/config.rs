//! Connection configuration.
//!
//! [`ConnectionConfig`] can be built with [`ConnectionBuilder`](crate::ConnectionBuilder)
//! setters or loaded from JSON. Missing fields take their defaults:
//!
//! ```
//! use ensemble_client::config::{BlockPolicy, ConnectionConfig};
//! use ensemble_client::WireFormat;
//!
//! let config = ConnectionConfig::from_json(r#"{"wire_format": "spawned"}"#).unwrap();
//! assert_eq!(config.wire_format, WireFormat::Spawned);
//! assert_eq!(config.effective_block_policy(), BlockPolicy::Auto);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{WireFormat, DEFAULT_MAX_HEADER_SIZE, DEFAULT_READ_BUFFER_SIZE};
use crate::writer::DEFAULT_WRITE_BUFFER_SIZE;

/// Who answers a Block upcall with BlockOk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockPolicy {
    /// The dispatcher sends BlockOk after `on_block` returns, unless the
    /// application already did.
    Auto,
    /// The application must call `Member::block_ok`.
    Manual,
}

/// Configuration for one engine connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub wire_format: WireFormat,
    /// Unset means the wire format's default: `Auto` for spawned,
    /// `Manual` for socket.
    pub block_policy: Option<BlockPolicy>,
    /// Largest accepted upcall header section, in bytes.
    pub max_header_size: usize,
    /// Initial capacity of the downcall header buffer.
    pub write_buffer_size: usize,
    /// Size of each read from the stream.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::default(),
            block_policy: None,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Block policy in effect for this configuration.
    ///
    /// Unless set, socket clients acknowledge blocks themselves and spawned
    /// clients acknowledge right after `on_block`.
    pub fn effective_block_policy(&self) -> BlockPolicy {
        self.block_policy.unwrap_or(match self.wire_format {
            WireFormat::Socket => BlockPolicy::Manual,
            WireFormat::Spawned => BlockPolicy::Auto,
        })
    }
}
