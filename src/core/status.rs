//! # Container lifecycle status and shutdown gates.
//!
//! [`Status`] is the closed state machine describing which phase the
//! container is in and which operations are currently legal. Transitions
//! are one-directional and never cyclic:
//!
//! ```text
//! NotStarted ──► Running ──► ShuttingDown ──► Cleared
//!                               │
//!                               └─ five gates, closed in a fixed order:
//!                                    main_queue → events → side_jobs
//!                                    → side_job_cancellation → state_change
//! ```
//!
//! ## Rules
//! - Exactly one `Status` value is live per container, owned by the
//!   coordinator and published through a `watch` channel.
//! - Every gated operation consults the live status before proceeding and
//!   fails descriptively if disallowed.
//! - Gate checks are pure functions of the status value; they never block.

use crate::error::ContainerError;

/// Lifecycle phase of the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Built but not started; all operations except `start()` are rejected.
    NotStarted,

    /// Fully operational.
    Running,

    /// Graceful shutdown in progress. Each flag is a gate that is open
    /// (`true`) until the coordinator closes it; the closing order is fixed
    /// and `state_change_open` closes only once no further command can run.
    ShuttingDown {
        /// State mutations still permitted (closes last).
        state_change_open: bool,
        /// New inputs still accepted (closes first).
        main_queue_open: bool,
        /// New events still accepted; the existing queue drains regardless.
        events_open: bool,
        /// New side jobs may still start.
        side_jobs_open: bool,
        /// Side jobs may still be manually cancelled (closes after
        /// `side_jobs_open`).
        side_job_cancellation_open: bool,
    },

    /// Torn down; every operation fails.
    Cleared,
}

impl Status {
    /// Returns a short stable label (snake_case) for use in logs/errors.
    pub fn as_label(&self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::Running => "running",
            Status::ShuttingDown { .. } => "shutting_down",
            Status::Cleared => "cleared",
        }
    }

    /// True while the container accepts regular work.
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Running)
    }

    /// Checks whether a new input may enter the queue.
    pub fn check_accept_input(&self) -> Result<(), ContainerError> {
        match self {
            Status::Running
            | Status::ShuttingDown {
                main_queue_open: true,
                ..
            } => Ok(()),
            other => Err(other.rejected("accept_input")),
        }
    }

    /// Checks whether a new event may be posted.
    pub fn check_post_event(&self) -> Result<(), ContainerError> {
        match self {
            Status::Running
            | Status::ShuttingDown {
                events_open: true, ..
            } => Ok(()),
            other => Err(other.rejected("post_event")),
        }
    }

    /// Checks whether state may still be mutated.
    pub fn check_mutate_state(&self) -> Result<(), ContainerError> {
        match self {
            Status::Running
            | Status::ShuttingDown {
                state_change_open: true,
                ..
            } => Ok(()),
            other => Err(other.rejected("mutate_state")),
        }
    }

    /// Checks whether a new side job may start.
    pub fn check_start_side_job(&self) -> Result<(), ContainerError> {
        match self {
            Status::Running
            | Status::ShuttingDown {
                side_jobs_open: true,
                ..
            } => Ok(()),
            other => Err(other.rejected("start_side_job")),
        }
    }

    /// Checks whether a side job may still be manually cancelled.
    pub fn check_cancel_side_job(&self) -> Result<(), ContainerError> {
        match self {
            Status::Running
            | Status::ShuttingDown {
                side_job_cancellation_open: true,
                ..
            } => Ok(()),
            other => Err(other.rejected("cancel_side_job")),
        }
    }

    fn rejected(&self, operation: &'static str) -> ContainerError {
        ContainerError::Rejected {
            operation,
            status: self.as_label(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_permits_everything() {
        let s = Status::Running;
        assert!(s.check_accept_input().is_ok());
        assert!(s.check_post_event().is_ok());
        assert!(s.check_mutate_state().is_ok());
        assert!(s.check_start_side_job().is_ok());
        assert!(s.check_cancel_side_job().is_ok());
    }

    #[test]
    fn test_not_started_rejects_with_status_label() {
        let err = Status::NotStarted.check_accept_input().unwrap_err();
        assert_eq!(
            err,
            ContainerError::Rejected {
                operation: "accept_input",
                status: "not_started",
            }
        );
    }

    #[test]
    fn test_cleared_rejects_everything() {
        let s = Status::Cleared;
        assert!(s.check_accept_input().is_err());
        assert!(s.check_post_event().is_err());
        assert!(s.check_mutate_state().is_err());
        assert!(s.check_start_side_job().is_err());
        assert!(s.check_cancel_side_job().is_err());
    }

    #[test]
    fn test_gates_close_independently() {
        // Main queue closed, everything else still open.
        let s = Status::ShuttingDown {
            state_change_open: true,
            main_queue_open: false,
            events_open: true,
            side_jobs_open: true,
            side_job_cancellation_open: true,
        };
        assert!(s.check_accept_input().is_err());
        assert!(s.check_post_event().is_ok());
        assert!(s.check_mutate_state().is_ok());
        assert!(s.check_start_side_job().is_ok());
        assert!(s.check_cancel_side_job().is_ok());

        // Only manual side-job cancellation left open.
        let s = Status::ShuttingDown {
            state_change_open: true,
            main_queue_open: false,
            events_open: false,
            side_jobs_open: false,
            side_job_cancellation_open: true,
        };
        assert!(s.check_start_side_job().is_err());
        assert!(s.check_cancel_side_job().is_ok());
    }

    #[test]
    fn test_shutting_down_with_all_gates_open_permits_everything() {
        let s = Status::ShuttingDown {
            state_change_open: true,
            main_queue_open: true,
            events_open: true,
            side_jobs_open: true,
            side_job_cancellation_open: true,
        };
        assert!(s.check_accept_input().is_ok());
        assert!(s.check_post_event().is_ok());
        assert!(s.check_mutate_state().is_ok());
        assert!(s.check_start_side_job().is_ok());
        assert!(s.check_cancel_side_job().is_ok());
    }
}
