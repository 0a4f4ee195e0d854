//! # stator
//!
//! **Stator** is a state-container runtime for Rust: all mutation of one
//! observable value is serialized behind message passing, inputs are
//! processed under a pluggable ordering strategy, and side effects run as
//! supervised, keyed, cancellable background jobs.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   send / try_send_now          post_event            interceptors
//!          │                         │                      ▲
//!          ▼                         ▼                      │
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Container (coordinator)                                          │
//! │  - Intake (status-gated admission for inputs and events)          │
//! │  - status watch (NotStarted ► Running ► ShuttingDown ► Cleared)   │
//! │  - Bus (broadcast notifications)                                  │
//! └──────┬─────────────────┬──────────────────┬───────────────────────┘
//!        ▼                 ▼                  ▼
//! ┌──────────────┐  ┌──────────────┐  ┌───────────────────┐
//! │ input worker │  │  dispatcher  │  │ SideJobSupervisor │
//! │ Fifo/Latest/ │  │ (FIFO events │  │ (keyed jobs,      │
//! │ Parallel     │  │  to handler) │  │  cancel + join)   │
//! └──────┬───────┘  └──────────────┘  └───────────────────┘
//!        │ InputScope (guard-checked capabilities)
//!        ▼
//! ┌──────────────┐
//! │ StateHolder  │──► watch (observe_state)
//! │ (one writer) │──► Bus: StateChanged (commit order)
//! └──────────────┘
//! ```
//!
//! ### Input lifecycle
//! ```text
//! submit ──► gate check ──► InputQueued ──► strategy picks up
//!                │                              │
//!                └─ closed: InputDropped        ├─► InputAccepted
//!                                               ├─► handler runs under guard
//!                                               │     ├─ Ok   ─► InputHandled
//!                                               │     ├─ Fail ─► rollback to
//!                                               │     │          snapshot,
//!                                               │     │          InputHandlerError
//!                                               │     └─ cancelled at .await ─►
//!                                               │          InputCancelled
//!                                               │          (commits kept)
//!                                               └─► completion future resolves
//! ```
//!
//! ## Features
//! | Area            | Description                                                   | Key types / traits                     |
//! |-----------------|---------------------------------------------------------------|----------------------------------------|
//! | **Machine API** | Define the input/event/state types and business handlers.     | [`Machine`], [`Handler`], [`EventHandler`] |
//! | **Strategies**  | Choose how concurrent inputs are ordered.                     | [`InputStrategy`]                      |
//! | **Side jobs**   | Keyed, restartable, cancellable background work.              | [`SideJobScope`], [`RestartReason`]    |
//! | **Observation** | Lifecycle notifications and state watching.                   | [`Notification`], [`Intercept`]        |
//! | **Lifecycle**   | Gated shutdown that never loses admitted work.                | [`Status`], [`Container`]              |
//! | **Errors**      | Typed errors for the runtime and for business handlers.       | [`ContainerError`], [`HandlerError`]   |
//! | **Configuration** | Centralize capacities, strategy, and teardown grace.        | [`Config`]                             |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use stator::{
//!     ContainerBuilder, Handler, HandlerError, InputScope, InputStrategy, Machine,
//! };
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
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let container = ContainerBuilder::new()
//!         .with_strategy(InputStrategy::Fifo)
//!         .build(0i64, Arc::new(Add));
//!
//!     container.start().await?;
//!     container.send_and_await(41).await?;
//!     container.send_and_await(1).await?;
//!     assert_eq!(container.state().await?, 42);
//!
//!     container.request_shutdown().await?;
//!     Ok(())
//! }
//! ```

mod core;
mod error;
mod interceptors;
mod machine;
mod notifications;

// ---- Public re-exports ----

pub use core::{
    Config, Container, ContainerBuilder, EventScope, InputScope, InputStrategy, QueuedItem,
    SideJobScope, Status,
};
pub use error::{ContainerError, HandlerError};
pub use interceptors::{Intercept, InterceptorScope};
pub use machine::{EventHandler, Handler, Machine};
pub use notifications::{Bus, Notification, NotificationKind, RestartReason};

#[cfg(feature = "logging")]
pub use interceptors::LogWriter;
