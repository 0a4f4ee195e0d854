//! Core runtime: lifecycle coordination, input queue, state holder, event
//! dispatcher, and side-job supervision.
//!
//! ## Contents
//! - [`Container`], [`ContainerBuilder`] — the owning handle and its wiring
//! - [`Config`], [`InputStrategy`] — tuning and ordering discipline
//! - [`Status`] — lifecycle state machine with shutdown gates
//! - [`InputScope`], [`EventScope`], [`SideJobScope`] — capability scopes
//!   handed to business code
//! - [`QueuedItem`] — units of work for the input queue

mod builder;
mod config;
mod coordinator;
mod dispatch;
mod guard;
mod sidejobs;
mod state;

pub(crate) mod queue;
pub(crate) mod status;

pub use builder::ContainerBuilder;
pub use config::Config;
pub use coordinator::Container;
pub use guard::{EventScope, InputScope};
pub use queue::{InputStrategy, QueuedItem};
pub use sidejobs::SideJobScope;
pub use status::Status;
