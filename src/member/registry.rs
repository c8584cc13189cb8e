//! Member registry: id allocation and status transitions.
//!
//! Every lookup-and-transition happens under one lock, entered by downcalls
//! (validate, encode, record) and by the dispatcher (apply an upcall). The
//! lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Member, MemberId, Status};
use crate::error::{EnsembleError, Result};
use crate::protocol::{DowncallKind, Event};
use crate::view::View;

/// State of one joined member.
pub(crate) struct MemberContext {
    pub(crate) status: Status,
    /// Most recently installed view.
    pub(crate) view: Option<Arc<View>>,
    /// Logical time of `view`, 0 before the first view.
    pub(crate) ltime: i32,
    /// BlockOk already sent for the current block.
    pub(crate) block_acked: bool,
    pub(crate) member: Member,
}

impl MemberContext {
    fn joining(member: Member) -> Self {
        Self {
            status: Status::Joining,
            view: None,
            ltime: 0,
            block_acked: false,
            member,
        }
    }

    /// Fail with a state error unless the status is one of `allowed`.
    pub(crate) fn require(&self, op: &'static str, allowed: &[Status]) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(EnsembleError::InvalidState {
                op,
                status: self.status,
            })
        }
    }

    /// Current view, required for rank arguments.
    pub(crate) fn current_view(&self) -> Result<&Arc<View>> {
        self.view
            .as_ref()
            .ok_or_else(|| EnsembleError::InvalidArgument("member has no view".into()))
    }

    /// Fail with a range error unless `rank` is in the current view.
    pub(crate) fn check_rank(&self, rank: usize) -> Result<()> {
        let nmembers = self.current_view()?.nmembers();
        if rank < nmembers {
            Ok(())
        } else {
            Err(EnsembleError::OutOfRange { rank, nmembers })
        }
    }

    /// Record the effect of a downcall that has been encoded.
    pub(crate) fn record_sent(&mut self, kind: DowncallKind) {
        match kind {
            DowncallKind::Leave => self.status = Status::Leaving,
            DowncallKind::BlockOk => self.block_acked = true,
            _ => {}
        }
    }
}

struct Members {
    members: HashMap<MemberId, MemberContext>,
    next_id: MemberId,
    /// Set by `drain`; no member can be added afterwards.
    closed: bool,
}

/// Registry mapping member ids to their state.
pub(crate) struct MemberRegistry {
    inner: Mutex<Members>,
}

impl MemberRegistry {
    /// Create an empty registry. Ids start from 1.
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Members {
                members: HashMap::new(),
                next_id: 1,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        // State is updated field by field under the lock, so a panic in a
        // holder cannot leave a half-applied transition behind.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and insert `member` as `Joining` if `stage` succeeds.
    ///
    /// `stage` runs under the lock with the id the member will get. If it
    /// fails, nothing is inserted and the id is not consumed.
    pub(crate) fn register<T>(
        &self,
        member: Member,
        stage: impl FnOnce(MemberId) -> Result<T>,
    ) -> Result<(MemberId, T)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EnsembleError::ConnectionClosed);
        }
        let id = inner.next_id;
        let staged = stage(id)?;
        inner.next_id += 1;
        inner.members.insert(id, MemberContext::joining(member));
        Ok((id, staged))
    }

    /// Run `f` on a live member. A missing id means the member has left.
    pub(crate) fn with_member<T>(
        &self,
        id: MemberId,
        op: &'static str,
        f: impl FnOnce(&mut MemberContext) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock();
        match inner.members.get_mut(&id) {
            Some(ctx) => f(ctx),
            None => Err(EnsembleError::InvalidState {
                op,
                status: Status::Left,
            }),
        }
    }

    /// Status of a member id. Unknown ids are `Left`.
    pub(crate) fn status(&self, id: MemberId) -> Status {
        self.lock()
            .members
            .get(&id)
            .map_or(Status::Left, |ctx| ctx.status)
    }

    pub(crate) fn view(&self, id: MemberId) -> Option<Arc<View>> {
        self.lock().members.get(&id).and_then(|ctx| ctx.view.clone())
    }

    /// True if the member is blocked and has not sent BlockOk yet.
    pub(crate) fn needs_block_ok(&self, id: MemberId) -> bool {
        self.lock()
            .members
            .get(&id)
            .is_some_and(|ctx| ctx.status == Status::Blocked && !ctx.block_acked)
    }

    /// Apply an upcall's state transition.
    ///
    /// Returns the member whose callback should run, or `None` if the
    /// upcall is dropped because the member is leaving or the registry was
    /// drained.
    ///
    /// # Errors
    ///
    /// A protocol error for an unknown id or an upcall the member's status
    /// does not allow.
    pub(crate) fn apply_upcall(&self, id: MemberId, event: &Event) -> Result<Option<Member>> {
        let mut inner = self.lock();
        let closed = inner.closed;
        let ctx = match inner.members.get_mut(&id) {
            Some(ctx) => ctx,
            None if closed => {
                tracing::debug!(member = id, "Dropping {:?} upcall after close", event.kind());
                return Ok(None);
            }
            None => {
                return Err(EnsembleError::protocol(format!(
                    "Upcall for unknown member {}",
                    id
                )))
            }
        };

        if ctx.status == Status::Leaving && !matches!(event, Event::Exit) {
            tracing::warn!(
                member = id,
                "Dropping {:?} upcall for leaving member",
                event.kind()
            );
            return Ok(None);
        }

        match event {
            Event::View(view) => {
                ctx.status = Status::Normal;
                ctx.ltime = view.ltime;
                ctx.view = Some(view.clone());
                ctx.block_acked = false;
            }
            Event::Cast { origin, .. } | Event::Send { origin, .. } => {
                let nmembers = ctx.view.as_ref().map_or(0, |v| v.nmembers());
                if *origin >= nmembers {
                    return Err(EnsembleError::protocol(format!(
                        "Message origin {} outside view of {} members for member {}",
                        origin, nmembers, id
                    )));
                }
            }
            Event::Heartbeat(_) => {}
            Event::Block => {
                if ctx.status != Status::Normal {
                    return Err(EnsembleError::protocol(format!(
                        "Block upcall for member {} while {}",
                        id, ctx.status
                    )));
                }
                ctx.status = Status::Blocked;
            }
            Event::Exit => {
                if ctx.status != Status::Leaving {
                    return Err(EnsembleError::protocol(format!(
                        "Exit upcall for member {} while {}",
                        id, ctx.status
                    )));
                }
                return Ok(inner.members.remove(&id).map(|ctx| ctx.member));
            }
        }
        Ok(Some(ctx.member.clone()))
    }

    /// Remove every member and refuse new ones. Used when the connection
    /// closes or fails.
    pub(crate) fn drain(&self) -> Vec<Member> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.members.drain().map(|(_, ctx)| ctx.member).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireFormat;
    use crate::view::tests::make_view;
    use crate::ConnectionBuilder;
    use bytes::Bytes;

    fn test_member() -> Member {
        let (client, _engine) = tokio::io::duplex(1024);
        let (conn, _dispatcher) = ConnectionBuilder::new().open(client);
        conn.member((), Arc::new(()))
    }

    fn registered(registry: &MemberRegistry) -> MemberId {
        registry.register(test_member(), |_| Ok(())).unwrap().0
    }

    fn view_event(ltime: i32) -> Event {
        Event::View(Arc::new(make_view(WireFormat::Socket, &["a", "b"], 0, ltime)))
    }

    #[tokio::test]
    async fn test_ids_sequential_from_one() {
        let registry = MemberRegistry::new();
        assert_eq!(registered(&registry), 1);
        assert_eq!(registered(&registry), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.status(1), Status::Joining);
    }

    #[tokio::test]
    async fn test_failed_stage_consumes_no_id() {
        let registry = MemberRegistry::new();
        let result = registry.register(test_member(), |_| -> Result<()> {
            Err(EnsembleError::InvalidArgument("bad".into()))
        });
        assert!(result.is_err());
        assert_eq!(registry.len(), 0);
        assert_eq!(registered(&registry), 1);
    }

    #[tokio::test]
    async fn test_view_block_view_cycle() {
        let registry = MemberRegistry::new();
        let id = registered(&registry);

        assert!(registry.apply_upcall(id, &view_event(1)).unwrap().is_some());
        assert_eq!(registry.status(id), Status::Normal);
        assert_eq!(registry.view(id).unwrap().ltime, 1);

        registry.apply_upcall(id, &Event::Block).unwrap();
        assert_eq!(registry.status(id), Status::Blocked);
        assert!(registry.needs_block_ok(id));

        registry
            .with_member(id, "block_ok", |ctx| {
                ctx.record_sent(DowncallKind::BlockOk);
                Ok(())
            })
            .unwrap();
        assert!(!registry.needs_block_ok(id));

        registry.apply_upcall(id, &view_event(2)).unwrap();
        assert_eq!(registry.status(id), Status::Normal);
        assert_eq!(registry.view(id).unwrap().ltime, 2);
    }

    #[tokio::test]
    async fn test_unknown_member_is_protocol_error() {
        let registry = MemberRegistry::new();
        let err = registry.apply_upcall(9, &Event::Block).unwrap_err();
        assert!(matches!(err, EnsembleError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_drained_registry_drops_upcalls() {
        let registry = MemberRegistry::new();
        let id = registered(&registry);
        assert_eq!(registry.drain().len(), 1);

        assert!(registry.apply_upcall(id, &Event::Block).unwrap().is_none());
        assert!(registry.apply_upcall(id + 1, &view_event(1)).unwrap().is_none());
        let err = registry.register(test_member(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, EnsembleError::ConnectionClosed));
        assert_eq!(registry.status(id), Status::Left);
    }

    #[tokio::test]
    async fn test_block_while_joining_is_protocol_error() {
        let registry = MemberRegistry::new();
        let id = registered(&registry);
        assert!(registry.apply_upcall(id, &Event::Block).is_err());
    }

    #[tokio::test]
    async fn test_cast_before_view_is_protocol_error() {
        let registry = MemberRegistry::new();
        let id = registered(&registry);
        let cast = Event::Cast {
            origin: 0,
            data: Bytes::from_static(b"x"),
        };
        assert!(registry.apply_upcall(id, &cast).is_err());
    }

    #[tokio::test]
    async fn test_origin_out_of_view_is_protocol_error() {
        let registry = MemberRegistry::new();
        let id = registered(&registry);
        registry.apply_upcall(id, &view_event(1)).unwrap();
        let send = Event::Send {
            origin: 2,
            data: Bytes::new(),
        };
        assert!(registry.apply_upcall(id, &send).is_err());
    }

    #[tokio::test]
    async fn test_leaving_drops_upcalls_until_exit() {
        let registry = MemberRegistry::new();
        let id = registered(&registry);
        registry
            .with_member(id, "leave", |ctx| {
                ctx.record_sent(DowncallKind::Leave);
                Ok(())
            })
            .unwrap();
        assert_eq!(registry.status(id), Status::Leaving);

        assert!(registry.apply_upcall(id, &view_event(1)).unwrap().is_none());
        assert!(registry.apply_upcall(id, &Event::Block).unwrap().is_none());
        assert_eq!(registry.status(id), Status::Leaving);

        assert!(registry.apply_upcall(id, &Event::Exit).unwrap().is_some());
        assert_eq!(registry.status(id), Status::Left);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_exit_without_leave_is_protocol_error() {
        let registry = MemberRegistry::new();
        let id = registered(&registry);
        registry.apply_upcall(id, &view_event(1)).unwrap();
        assert!(registry.apply_upcall(id, &Event::Exit).is_err());
        assert_eq!(registry.status(id), Status::Normal);
    }

    #[tokio::test]
    async fn test_check_rank() {
        let registry = MemberRegistry::new();
        let id = registered(&registry);
        let before_view = registry.with_member(id, "send1", |ctx| ctx.check_rank(0));
        assert!(matches!(before_view, Err(EnsembleError::InvalidArgument(_))));

        registry.apply_upcall(id, &view_event(1)).unwrap();
        registry
            .with_member(id, "send1", |ctx| ctx.check_rank(1))
            .unwrap();
        let err = registry
            .with_member(id, "send1", |ctx| ctx.check_rank(2))
            .unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::OutOfRange {
                rank: 2,
                nmembers: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let registry = MemberRegistry::new();
        registered(&registry);
        registered(&registry);
        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.status(1), Status::Left);
    }
}
