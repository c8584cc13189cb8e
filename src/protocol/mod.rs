//! Protocol module - wire formats, framing, and typed messages.
//!
//! This module implements the engine protocol on top of [`crate::codec`]:
//! - Socket and spawned wire formats, opcode tables, frame precursor
//! - Frame buffer for accumulating partial reads
//! - Typed downcalls and upcalls

mod downcall;
mod frame;
mod frame_buffer;
mod upcall;
mod wire_format;

pub use downcall::{
    Downcall, DowncallFrame, JoinOps, DEFAULT_HEARTBEAT_RATE, DEFAULT_PROPERTIES,
    DEFAULT_TRANSPORTS,
};
pub use frame::{build_frame, Frame};
pub use frame_buffer::{FrameBuffer, DEFAULT_READ_BUFFER_SIZE};
pub use upcall::Event;
pub use wire_format::{
    DowncallKind, Precursor, UpcallKind, WireFormat, DEFAULT_MAX_HEADER_SIZE, MAX_PRECURSOR_SIZE,
};
