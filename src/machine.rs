//! # User-facing seam: machine types and handler traits.
//!
//! A [`Machine`] bundles the three associated types a container is generic
//! over: the command type ([`Machine::Input`]), the one-shot notification
//! type ([`Machine::Event`]), and the observable value ([`Machine::State`]).
//!
//! Business logic plugs in through two async traits:
//! - [`Handler`] — processes inputs under a guard-checked [`InputScope`];
//! - [`EventHandler`] — consumes events dispatched strictly in FIFO order.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use stator::{Handler, HandlerError, InputScope, Machine};
//!
//! struct Counter;
//!
//! impl Machine for Counter {
//!     type Input = i64;
//!     type Event = String;
//!     type State = i64;
//! }
//!
//! struct Add;
//!
//! #[async_trait]
//! impl Handler<Counter> for Add {
//!     async fn handle(
//!         &self,
//!         scope: &mut InputScope<Counter>,
//!         input: i64,
//!     ) -> Result<(), HandlerError> {
//!         scope.mutate(move |n| n + input).await?;
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;

use async_trait::async_trait;

use crate::core::{EventScope, InputScope};
use crate::error::HandlerError;

/// Associated types of one container: its inputs, events, and state.
///
/// `Input` and `Event` must be `Debug` so lifecycle notifications can carry
/// a rendering of them; `State` must be `Clone` because every committed
/// value is published to observers.
pub trait Machine: Send + Sync + 'static {
    /// A unit of work submitted to change state and/or trigger effects.
    type Input: fmt::Debug + Send + 'static;
    /// A one-shot notification emitted for an external handler.
    type Event: fmt::Debug + Send + 'static;
    /// The single current value owned by the state holder.
    type State: fmt::Debug + Clone + Send + Sync + 'static;
}

/// # Business handler for inputs.
///
/// Invoked once per accepted queued item, under a fresh [`InputScope`]. The
/// scope is the only path to side effects (read/mutate state, post events,
/// start/cancel side jobs) and every capability on it is gated by the
/// invocation's guard: the instant `handle` returns, the guard closes and
/// any retained use of the scope fails fast.
///
/// Returning `Err(HandlerError::Fail { .. })` rolls state back to the value
/// it had when the invocation started and reports a handler-error
/// notification; it never crashes the container.
#[async_trait]
pub trait Handler<M: Machine>: Send + Sync + 'static {
    /// Processes one input to completion.
    ///
    /// Cancellation (preemption under the preempt-latest strategy, or
    /// container teardown) takes effect only at `.await` points inside this
    /// method; a mutation already submitted always commits.
    async fn handle(&self, scope: &mut InputScope<M>, input: M::Input) -> Result<(), HandlerError>;
}

/// # External consumer of events.
///
/// At most one handler is attached to the event dispatcher at a time.
/// Events posted while no handler is attached buffer until one attaches.
/// A failure from `on_event` is reported and the dispatch loop continues
/// with the next event.
#[async_trait]
pub trait EventHandler<M: Machine>: Send + Sync + 'static {
    /// Consumes one event.
    ///
    /// The scope allows feeding inputs back into the container; it grants
    /// no state-mutation rights.
    async fn on_event(&self, scope: &EventScope<M>, event: M::Event) -> Result<(), HandlerError>;
}
