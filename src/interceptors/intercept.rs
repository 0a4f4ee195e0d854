//! Interceptor trait: an observer of the container's notification stream
//! that can also feed work back in.

use async_trait::async_trait;

use super::scope::InterceptorScope;
use crate::machine::Machine;
use crate::notifications::Notification;

/// # Observer of the container's lifecycle notification stream.
///
/// Each interceptor runs on its own worker task with a private bounded
/// queue, so one slow interceptor never blocks the runtime or its siblings;
/// it only loses its own oldest notifications. A panic inside an
/// interceptor is caught, reported, and delivery continues.
///
/// The [`InterceptorScope`] lets an interceptor inject inputs, restore
/// items, and events back into the container, subject to the same
/// lifecycle gates as the public API. This is the hook for persistence
/// replay, devtools, and test drivers.
#[async_trait]
pub trait Intercept<M: Machine>: Send + Sync + 'static {
    /// Stable name, used in attach/failure notifications.
    fn name(&self) -> &str;

    /// Capacity of this interceptor's private queue (min 1; clamped).
    /// Notifications beyond it are dropped for this interceptor only.
    fn queue_capacity(&self) -> usize {
        256
    }

    /// Called once when the worker starts, before any notification.
    async fn on_attach(&self, _scope: &InterceptorScope<M>) {}

    /// Consumes one notification.
    async fn on_notification(&self, scope: &InterceptorScope<M>, note: Notification<M>);
}
