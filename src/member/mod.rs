//! Group members: lifecycle, registry and the downcall API.
//!
//! Provides:
//! - [`Member`] - handle for one group membership, issues downcalls
//! - [`MemberCallbacks`] - upcall handlers bound to a member
//! - [`Status`] - where a member is in its lifecycle
//!
//! A member moves through
//!
//! ```text
//! Pre ─join─► Joining ─View─► Normal ─Block─► Blocked ─View─► Normal ...
//!                │              │                │
//!                └──────────────┴─────leave──────┴─► Leaving ─Exit─► Left
//! ```
//!
//! and no other transition is possible.

mod callbacks;
mod handle;
mod registry;

use std::fmt;

pub use callbacks::{BoxFuture, Env, MemberCallbacks};
pub use handle::Member;
pub(crate) use registry::MemberRegistry;

/// Member id, unique for the lifetime of a connection.
pub type MemberId = u32;

/// Lifecycle status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Created, not yet joined.
    Pre,
    /// Join sent, waiting for the first view.
    Joining,
    /// In a view; all downcalls allowed.
    Normal,
    /// View change in progress; only `block_ok`, `send_blocked` and
    /// `leave` allowed.
    Blocked,
    /// Leave sent, waiting for exit.
    Leaving,
    /// Exited, or the connection failed.
    Left,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Pre => "Pre",
            Status::Joining => "Joining",
            Status::Normal => "Normal",
            Status::Blocked => "Blocked",
            Status::Leaving => "Leaving",
            Status::Left => "Left",
        };
        f.write_str(name)
    }
}
