//! Error types used by the stator runtime and business handlers.
//!
//! This module defines two main error enums:
//!
//! - [`ContainerError`] — errors raised by the container runtime itself
//!   (lifecycle gating, queue admission, guard violations, shutdown).
//! - [`HandlerError`] — errors raised by business handlers (input handlers,
//!   event handlers, side-job bodies).
//!
//! Both types provide `as_label()` helpers for logging/metrics. Cancellation
//! is modeled as its own variant on both enums and is never conflated with
//! failure: completion futures and notifications resolve with a cancelled
//! status, not an error status.

use std::time::Duration;
use thiserror::Error;

/// # Errors produced by the container runtime.
///
/// These represent rejections and failures of the coordination machinery,
/// not of business logic. Gate rejections carry the operation that was
/// attempted and the status label it was attempted under.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContainerError {
    /// Operation rejected by a lifecycle gate (status check).
    #[error("'{operation}' not permitted while container status is '{status}'")]
    Rejected {
        /// The gated operation that was attempted.
        operation: &'static str,
        /// Status label at the time of the attempt.
        status: &'static str,
    },

    /// Input queue is at capacity; `try_send_now` refused the item.
    #[error("input queue is full")]
    QueueFull,

    /// The target actor's queue is closed (container cleared or torn down).
    #[error("queue is closed")]
    QueueClosed,

    /// The business handler for this item returned a failure.
    #[error("handler failed: {error}")]
    HandlerFailed {
        /// The underlying handler error message.
        error: String,
    },

    /// The invocation was cancelled (preemption or shutdown), not failed.
    #[error("invocation cancelled")]
    Cancelled,

    /// A handler capability was used after its invocation already returned.
    ///
    /// This is a programming-error class: a handler illegally retained its
    /// invocation scope and reused it from another task.
    #[error("guard violation: '{operation}' used after the handler invocation returned")]
    GuardClosed {
        /// The capability that was attempted on the closed guard.
        operation: &'static str,
    },

    /// An event handler is already attached; the dispatcher never detaches
    /// implicitly.
    #[error("event handler already attached; detach it first")]
    HandlerAlreadyAttached,

    /// `start()` called on a container that already left `NotStarted`.
    #[error("start requires a fresh container (status: '{status}')")]
    AlreadyStarted {
        /// Status label at the time of the call.
        status: &'static str,
    },

    /// `clear()` called on a container that is already `Cleared`.
    #[error("container is already cleared")]
    AlreadyCleared,

    /// `request_shutdown()` called outside of `Running`.
    #[error("shutdown requires a running container (status: '{status}')")]
    NotRunning {
        /// Status label at the time of the call.
        status: &'static str,
    },

    /// Teardown grace period was exceeded; some side jobs remained stuck.
    #[error("shutdown grace {grace:?} exceeded; stuck side jobs: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Keys of side jobs that did not stop in time.
        stuck: Vec<String>,
    },
}

impl ContainerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ContainerError::Rejected { .. } => "rejected",
            ContainerError::QueueFull => "queue_full",
            ContainerError::QueueClosed => "queue_closed",
            ContainerError::HandlerFailed { .. } => "handler_failed",
            ContainerError::Cancelled => "cancelled",
            ContainerError::GuardClosed { .. } => "guard_closed",
            ContainerError::HandlerAlreadyAttached => "handler_already_attached",
            ContainerError::AlreadyStarted { .. } => "already_started",
            ContainerError::AlreadyCleared => "already_cleared",
            ContainerError::NotRunning { .. } => "not_running",
            ContainerError::GraceExceeded { .. } => "grace_exceeded",
        }
    }

    /// True for cancellation outcomes, which are not failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ContainerError::Cancelled)
    }
}

/// # Errors produced by business handlers.
///
/// Returned by input handlers, event handlers, and side-job bodies. A
/// handler failure is caught locally, reported as a notification, and never
/// crashes the container; the owning queue proceeds to the next item.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Handler execution failed.
    #[error("execution failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Handler observed cancellation and exited cooperatively.
    #[error("invocation cancelled")]
    Canceled,
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::Fail`].
    pub fn fail(error: impl Into<String>) -> Self {
        HandlerError::Fail {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            HandlerError::Fail { .. } => "handler_fail",
            HandlerError::Canceled => "handler_canceled",
        }
    }

    /// True if this is a cooperative cancellation, not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HandlerError::Canceled)
    }
}

impl From<ContainerError> for HandlerError {
    /// Lets handlers propagate scope failures with `?`. Cancellation stays
    /// cancellation; everything else becomes a failure carrying the
    /// rendered message.
    fn from(err: ContainerError) -> Self {
        if err.is_cancellation() {
            HandlerError::Canceled
        } else {
            HandlerError::Fail {
                error: err.to_string(),
            }
        }
    }
}

/// Renders a caught panic payload for notification details.
pub(crate) fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_stable() {
        let err = ContainerError::Rejected {
            operation: "send",
            status: "cleared",
        };
        assert_eq!(err.as_label(), "rejected");
        assert_eq!(ContainerError::Cancelled.as_label(), "cancelled");
        assert_eq!(HandlerError::fail("boom").as_label(), "handler_fail");
    }

    #[test]
    fn test_cancellation_is_not_failure() {
        assert!(ContainerError::Cancelled.is_cancellation());
        assert!(!ContainerError::QueueFull.is_cancellation());
        assert!(HandlerError::Canceled.is_cancellation());
        assert!(!HandlerError::fail("x").is_cancellation());
    }

    #[test]
    fn test_container_errors_propagate_into_handler_errors() {
        // The `?` path out of a handler: failure keeps the rendered message.
        let err: HandlerError = ContainerError::QueueFull.into();
        assert_eq!(err.as_label(), "handler_fail");
        assert!(err.to_string().contains("input queue is full"));

        // Cancellation stays cancellation, never a failure.
        let cancelled: HandlerError = ContainerError::Cancelled.into();
        assert!(cancelled.is_cancellation());
    }

    #[test]
    fn test_panic_payloads_render_their_message() {
        let caught = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_text(&*caught), "static message");

        let caught = std::panic::catch_unwind(|| panic!("{} message", "formatted")).unwrap_err();
        assert_eq!(panic_text(&*caught), "formatted message");
    }

    #[test]
    fn test_rejection_message_names_operation_and_status() {
        let err = ContainerError::Rejected {
            operation: "post_event",
            status: "shutting_down",
        };
        let msg = err.to_string();
        assert!(msg.contains("post_event"), "message: {msg}");
        assert!(msg.contains("shutting_down"), "message: {msg}");
    }
}
