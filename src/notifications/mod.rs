//! Lifecycle notifications: data model and broadcast bus.
//!
//! This module groups the notification **data model** and the **bus** used
//! to publish/subscribe to the lifecycle stream produced by the container's
//! actors.
//!
//! ## Contents
//! - [`NotificationKind`], [`Notification`] — classification and metadata
//! - [`RestartReason`] — why a side job (re)started under its key
//! - [`Bus`] — thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Producers**: input queue, state holder, event dispatcher, side-job
//!   supervisor, interceptor fan-out workers, coordinator.
//! - **Consumers**: the interceptor fan-out listener, plus any raw
//!   subscription handed out by `Container::notifications()`.

mod bus;
mod notification;

pub use bus::Bus;
pub use notification::{Notification, NotificationKind, RestartReason};

pub(crate) use notification::next_item_id;
