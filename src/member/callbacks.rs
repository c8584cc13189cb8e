//! Application callbacks for upcalls.

use std::any::Any;
use std::future::{ready, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::Member;
use crate::error::Result;
use crate::view::View;

/// Boxed future returned by callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque application value handed back on every callback.
pub type Env = Arc<dyn Any + Send + Sync>;

/// Upcall handlers for one member.
///
/// The dispatcher awaits each callback before reading the next frame, so
/// callbacks for members of the same connection never run concurrently.
/// A callback may issue downcalls on any member, including its own.
///
/// Every method has a default that ignores the upcall. Returning `Err` is
/// logged by the dispatcher and does not stop dispatch.
///
/// ```
/// use bytes::Bytes;
/// use ensemble_client::member::{BoxFuture, Env, Member, MemberCallbacks};
///
/// struct Echo;
///
/// impl MemberCallbacks for Echo {
///     fn on_send<'a>(
///         &'a self,
///         member: &'a Member,
///         _env: &'a Env,
///         origin: usize,
///         data: Bytes,
///     ) -> BoxFuture<'a, ensemble_client::Result<()>> {
///         Box::pin(async move { member.send1(origin, data).await })
///     }
/// }
/// ```
pub trait MemberCallbacks: Send + Sync + 'static {
    /// A new view was installed. The member is `Normal`.
    fn on_view<'a>(
        &'a self,
        member: &'a Member,
        env: &'a Env,
        view: Arc<View>,
    ) -> BoxFuture<'a, Result<()>> {
        let _ = (member, env, view);
        Box::pin(ready(Ok(())))
    }

    /// Multicast from rank `origin` of the current view.
    fn on_cast<'a>(
        &'a self,
        member: &'a Member,
        env: &'a Env,
        origin: usize,
        data: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        let _ = (member, env, origin, data);
        Box::pin(ready(Ok(())))
    }

    /// Point-to-point message from rank `origin` of the current view.
    fn on_send<'a>(
        &'a self,
        member: &'a Member,
        env: &'a Env,
        origin: usize,
        data: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        let _ = (member, env, origin, data);
        Box::pin(ready(Ok(())))
    }

    fn on_heartbeat<'a>(
        &'a self,
        member: &'a Member,
        env: &'a Env,
        time: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        let _ = (member, env, time);
        Box::pin(ready(Ok(())))
    }

    /// The group is about to change views. The member is `Blocked` until
    /// the next view and should stop sending.
    fn on_block<'a>(&'a self, member: &'a Member, env: &'a Env) -> BoxFuture<'a, Result<()>> {
        let _ = (member, env);
        Box::pin(ready(Ok(())))
    }

    /// The member has left the group. It is `Left` and no further upcalls
    /// arrive for it.
    fn on_exit<'a>(&'a self, member: &'a Member, env: &'a Env) -> BoxFuture<'a, Result<()>> {
        let _ = (member, env);
        Box::pin(ready(Ok(())))
    }
}

/// Ignores every upcall.
impl MemberCallbacks for () {}
