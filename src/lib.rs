//! # ensemble-client
//!
//! Async client for the Ensemble group-communication engine.
//!
//! An application joins process groups through an engine running as a
//! separate process, reached over TCP or over the stdio of a spawned
//! helper. The engine delivers totally ordered multicasts, point-to-point
//! messages and membership views; this crate speaks its framed protocol.
//!
//! ## Architecture
//!
//! - **Connection** (write half): members issue downcalls, one whole frame
//!   at a time under a write lock
//! - **Dispatcher** (read half): decodes upcalls, drives each member's
//!   lifecycle and awaits its callbacks in arrival order
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use ensemble_client::member::{BoxFuture, Env, Member, MemberCallbacks};
//! use ensemble_client::{ConnectionBuilder, JoinOps, Result};
//!
//! struct Printer;
//!
//! impl MemberCallbacks for Printer {
//!     fn on_cast<'a>(
//!         &'a self,
//!         _member: &'a Member,
//!         _env: &'a Env,
//!         origin: usize,
//!         data: Bytes,
//!     ) -> BoxFuture<'a, Result<()>> {
//!         Box::pin(async move {
//!             println!("{}: {:?}", origin, data);
//!             Ok(())
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (conn, dispatcher) = ConnectionBuilder::new()
//!         .connect_tcp("localhost", 5002)
//!         .await?;
//!     let dispatch = dispatcher.spawn();
//!
//!     let member = conn.member(Printer, Arc::new(()));
//!     member.join(JoinOps::new("chat")).await?;
//!     // ... once the first view arrives:
//!     member.cast("hello").await?;
//!
//!     dispatch.await.ok();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod member;
pub mod protocol;
pub mod transport;
pub mod view;

mod client;
mod reader;
mod writer;

pub use client::{Connection, ConnectionBuilder, Dispatcher};
pub use config::{BlockPolicy, ConnectionConfig};
pub use error::{EnsembleError, Result};
pub use member::{Member, MemberCallbacks, Status};
pub use protocol::{Event, JoinOps, UpcallKind, WireFormat};
pub use view::{Endpoint, View, ViewId};
