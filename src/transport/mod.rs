//! Transport module - streams to the engine.
//!
//! Provides:
//! - TCP (all platforms)
//! - Unix Domain Sockets (Linux/macOS)
//! - stdio of a spawned engine process
//!
//! Any `AsyncRead + AsyncWrite` stream works with
//! [`ConnectionBuilder::open`](crate::ConnectionBuilder::open); these are
//! the common ones.

mod stream;

#[cfg(unix)]
pub use stream::connect_unix;
pub use stream::{connect_tcp, ChildStdio, DEFAULT_PORT};
