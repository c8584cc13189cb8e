//! The [`Member`] handle and its downcalls.
//!
//! Every downcall follows the same path:
//! 1. Fail fast if the connection is closed
//! 2. Take the write lock
//! 3. Under the registry lock, check the status and arguments, encode the
//!    header into the writer's buffer and record the transition
//! 4. Write and flush the frame
//!
//! A failed check in step 3 leaves the stream untouched. A failed write is
//! fatal to the connection.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;

use super::registry::MemberContext;
use super::{Env, MemberCallbacks, MemberId, Status};
use crate::client::Shared;
use crate::error::{EnsembleError, Result};
use crate::protocol::{Downcall, JoinOps, WireFormat};
use crate::view::{Endpoint, View};

/// Handle for one group membership on a connection.
///
/// Cheap to clone; clones refer to the same member. Created in `Pre` by
/// [`Connection::member`](crate::Connection::member).
///
/// The registry keeps a clone of every joined member, so a member only
/// refers weakly to its connection. Once the connection and dispatcher
/// are gone, downcalls fail with `ConnectionClosed`.
#[derive(Clone)]
pub struct Member {
    inner: Arc<MemberInner>,
}

struct MemberInner {
    /// Set once by `join`.
    id: OnceLock<MemberId>,
    conn: Weak<Shared>,
    callbacks: Arc<dyn MemberCallbacks>,
    env: Env,
}

impl Member {
    pub(crate) fn new(conn: Weak<Shared>, callbacks: Arc<dyn MemberCallbacks>, env: Env) -> Self {
        Self {
            inner: Arc::new(MemberInner {
                id: OnceLock::new(),
                conn,
                callbacks,
                env,
            }),
        }
    }

    /// Member id, assigned by `join`.
    pub fn id(&self) -> Option<MemberId> {
        self.inner.id.get().copied()
    }

    /// Current status.
    pub fn status(&self) -> Status {
        match (self.id(), self.inner.conn.upgrade()) {
            (None, _) => Status::Pre,
            (Some(id), Some(conn)) => conn.registry.status(id),
            (Some(_), None) => Status::Left,
        }
    }

    /// Most recently installed view.
    pub fn view(&self) -> Option<Arc<View>> {
        let id = self.id()?;
        self.inner.conn.upgrade()?.registry.view(id)
    }

    /// Own rank in the current view.
    pub fn rank(&self) -> Option<usize> {
        self.view().map(|v| v.rank)
    }

    /// Environment value given at creation.
    pub fn env(&self) -> &Env {
        &self.inner.env
    }

    /// Environment value, if it has type `T`.
    pub fn env_as<T: Any>(&self) -> Option<&T> {
        self.inner.env.downcast_ref::<T>()
    }

    pub(crate) fn callbacks(&self) -> &dyn MemberCallbacks {
        self.inner.callbacks.as_ref()
    }

    fn conn(&self) -> Result<Arc<Shared>> {
        let conn = self
            .inner
            .conn
            .upgrade()
            .ok_or(EnsembleError::ConnectionClosed)?;
        conn.ensure_open()?;
        Ok(conn)
    }

    /// Join a group. Legal only in `Pre`; the member becomes `Joining` and
    /// then `Normal` when the first view arrives.
    pub async fn join(&self, ops: JoinOps) -> Result<()> {
        let conn = self.conn()?;
        self.require_unjoined()?;
        ops.validate()?;

        let group = ops.group_name.clone();
        let downcall = Downcall::Join(ops);
        let mut writer = conn.writer.lock().await;
        conn.ensure_open()?;
        // Recheck under the write lock: a concurrent join may have won.
        self.require_unjoined()?;

        let staged = conn.registry.register(self.clone(), |id| {
            let enc = writer.begin()?;
            downcall.encode(enc, id, 0)
        });
        let (id, bulk) = match staged {
            Ok(staged) => staged,
            Err(e) => return Err(conn.check_fatal(e)),
        };
        // Only this call can reach here with the id unset.
        let _ = self.inner.id.set(id);

        tracing::debug!(member = id, group = %group, "Sending join");
        let written = writer.end(bulk).await;
        written.map_err(|e| conn.check_fatal(e))
    }

    /// Leave the group. Legal in `Joining`, `Normal` and `Blocked`; the
    /// member becomes `Leaving` and then `Left` on exit.
    pub async fn leave(&self) -> Result<()> {
        self.downcall("leave", |ctx, _| {
            ctx.require("leave", &[Status::Joining, Status::Normal, Status::Blocked])?;
            Ok(Downcall::Leave)
        })
        .await
    }

    /// Multicast to the whole view.
    pub async fn cast(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.downcall("cast", |ctx, _| {
            ctx.require("cast", &[Status::Normal])?;
            Ok(Downcall::Cast(data))
        })
        .await
    }

    /// Send to several ranks of the current view.
    ///
    /// Only the socket wire format can address more than one rank per frame.
    pub async fn send(&self, dests: &[usize], data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.downcall("send", |ctx, _| {
            ctx.require("send", &[Status::Normal])?;
            for &rank in dests {
                ctx.check_rank(rank)?;
            }
            Ok(Downcall::Send {
                dests: dests.to_vec(),
                data,
            })
        })
        .await
    }

    /// Send to one rank of the current view.
    pub async fn send1(&self, dest: usize, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.downcall("send1", |ctx, _| {
            ctx.require("send1", &[Status::Normal])?;
            ctx.check_rank(dest)?;
            Ok(Downcall::Send1 { dest, data })
        })
        .await
    }

    /// Send to an endpoint by name. Spawned wire format only.
    ///
    /// Unlike `send1`, this is legal while `Blocked`, before or after
    /// `block_ok`, since the destination need not keep its rank in the
    /// next view.
    pub async fn send_blocked(&self, dest: Endpoint, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.downcall("send_blocked", |ctx, _| {
            ctx.require("send_blocked", &[Status::Normal, Status::Blocked])?;
            Ok(Downcall::SendBlocked { dest, data })
        })
        .await
    }

    /// Report ranks of the current view as failure-suspected.
    pub async fn suspect(&self, ranks: &[usize]) -> Result<()> {
        self.downcall("suspect", |ctx, format| {
            ctx.require("suspect", &[Status::Normal])?;
            for &rank in ranks {
                ctx.check_rank(rank)?;
            }
            Ok(match format {
                WireFormat::Socket => Downcall::Suspect(ranks.to_vec()),
                WireFormat::Spawned => {
                    let view = ctx.current_view()?;
                    Downcall::SuspectEndpoints(
                        ranks.iter().map(|&r| view.members[r].clone()).collect(),
                    )
                }
            })
        })
        .await
    }

    /// Acknowledge a block. Legal once per block, in `Blocked`.
    pub async fn block_ok(&self) -> Result<()> {
        self.downcall("block_ok", |ctx, _| {
            ctx.require("block_ok", &[Status::Blocked])?;
            if ctx.block_acked {
                return Err(EnsembleError::InvalidArgument(
                    "block already acknowledged".into(),
                ));
            }
            Ok(Downcall::BlockOk)
        })
        .await
    }

    /// Report that state transfer has finished.
    pub async fn xfer_done(&self) -> Result<()> {
        self.simple("xfer_done", Downcall::XferDone).await
    }

    /// Request a switch to an explicit protocol stack.
    pub async fn change_protocol(&self, protocol: &str) -> Result<()> {
        self.simple("change_protocol", Downcall::ChangeProtocol(protocol.to_string()))
            .await
    }

    /// Request a switch to the stack providing `properties`.
    pub async fn change_properties(&self, properties: &str) -> Result<()> {
        self.simple(
            "change_properties",
            Downcall::ChangeProperties(properties.to_string()),
        )
        .await
    }

    /// Request a new group key.
    pub async fn rekey(&self) -> Result<()> {
        self.simple("rekey", Downcall::Rekey).await
    }

    /// Ask the engine to start a view change now.
    pub async fn prompt(&self) -> Result<()> {
        self.simple("prompt", Downcall::Prompt).await
    }

    fn require_unjoined(&self) -> Result<()> {
        if self.id().is_some() {
            return Err(EnsembleError::InvalidState {
                op: "join",
                status: self.status(),
            });
        }
        Ok(())
    }

    /// A downcall with no arguments to check, legal in `Normal`.
    async fn simple(&self, op: &'static str, downcall: Downcall) -> Result<()> {
        self.downcall(op, |ctx, _| {
            ctx.require(op, &[Status::Normal])?;
            Ok(downcall)
        })
        .await
    }

    async fn downcall<F>(&self, op: &'static str, build: F) -> Result<()>
    where
        F: FnOnce(&MemberContext, WireFormat) -> Result<Downcall>,
    {
        let conn = self.conn()?;
        let id = self.id().ok_or(EnsembleError::InvalidState {
            op,
            status: Status::Pre,
        })?;

        let mut writer = conn.writer.lock().await;
        conn.ensure_open()?;
        let format = writer.format();

        let staged = conn.registry.with_member(id, op, |ctx| {
            let downcall = build(ctx, format)?;
            let enc = writer.begin()?;
            let bulk = downcall.encode(enc, id, ctx.ltime)?;
            ctx.record_sent(downcall.kind());
            Ok(bulk)
        });
        let bulk = staged.map_err(|e| conn.check_fatal(e))?;

        tracing::debug!(member = id, "Sending {}", op);
        let written = writer.end(bulk).await;
        written.map_err(|e| conn.check_fatal(e))
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
