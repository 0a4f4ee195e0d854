//! # Lifecycle notifications emitted by the container's actors.
//!
//! The [`NotificationKind`] enum is the closed union of everything the
//! runtime reports about itself, across five categories:
//! - **Inputs**: queued, accepted, rejected, dropped, handled, cancelled, errored
//! - **Events**: queued, emitted, processing start/stop, handled, errored
//! - **State**: committed value changed
//! - **Side jobs**: queued, started (with restart reason), terminal outcomes
//! - **Container**: interceptor attach/failure, unhandled errors, status changes
//!
//! The [`Notification`] struct carries metadata shared by all kinds:
//! timestamp, item correlation id, side-job key or interceptor name, and a
//! human-readable detail rendering.
//!
//! ## Ordering guarantees
//! Each notification has a globally unique sequence number (`seq`) that
//! increases monotonically. Use `seq` to restore the exact production order
//! when notifications are consumed from independently scheduled workers.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::core::Status;
use crate::machine::Machine;

/// Global sequence counter for notification ordering.
static NOTE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Global id counter for queued items and events.
static ITEM_SEQ: AtomicU64 = AtomicU64::new(0);

/// Allocates the next item correlation id.
pub(crate) fn next_item_id() -> u64 {
    ITEM_SEQ.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Why a side job (re)started under its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// No prior entry existed for the key.
    Initial,
    /// A live job under the same key was cancelled and replaced.
    Restarted,
    /// The key was seen before, but its job had already finished.
    Retried,
}

impl RestartReason {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RestartReason::Initial => "initial",
            RestartReason::Restarted => "restarted",
            RestartReason::Retried => "retried",
        }
    }
}

/// Classification of lifecycle notifications.
///
/// Closed union: every producer in the runtime maps to exactly one variant
/// here, and consumers can match exhaustively.
pub enum NotificationKind<M: Machine> {
    // === Inputs ===
    /// Item entered the input queue.
    ///
    /// Sets: `item`, `detail` (input rendering).
    InputQueued,

    /// The active strategy picked the item up and its handler invocation is
    /// about to run.
    ///
    /// Sets: `item`, `detail` (input rendering).
    InputAccepted,

    /// Item refused without a status violation (input queue at capacity).
    ///
    /// Sets: `item`, `detail` (reason).
    InputRejected,

    /// Item refused by a lifecycle gate; no handler was invoked.
    ///
    /// Sets: `item`, `detail` (gate error).
    InputDropped,

    /// Handler invocation returned successfully.
    ///
    /// Sets: `item`.
    InputHandled,

    /// Handler invocation was cancelled (preemption or teardown). Committed
    /// mutations made before the cancellation point are kept.
    ///
    /// Sets: `item`.
    InputCancelled,

    /// Handler invocation failed; state was rolled back to the value it had
    /// when the invocation started.
    ///
    /// Sets: `item`, `detail` (error message).
    InputHandlerError,

    // === Events ===
    /// Event entered the dispatcher's FIFO queue.
    ///
    /// Sets: `item`, `detail` (event rendering).
    EventQueued,

    /// Event popped from the queue for delivery to the attached handler.
    ///
    /// Sets: `item`, `detail` (event rendering).
    EventEmitted,

    /// Event handler invocation is starting.
    ///
    /// Sets: `item`.
    EventProcessingStarted,

    /// Event handler invocation returned (successfully or not).
    ///
    /// Sets: `item`.
    EventProcessingStopped,

    /// Event handler returned successfully.
    ///
    /// Sets: `item`.
    EventHandled,

    /// Event handler failed; the dispatch loop continues with the next
    /// event.
    ///
    /// Sets: `item`, `detail` (error message).
    EventHandlerError,

    // === State ===
    /// A new value was committed by the state holder. Published in commit
    /// order; no value is skipped.
    ///
    /// Sets: the committed state.
    StateChanged {
        /// The newly committed value.
        state: M::State,
    },

    // === Side jobs ===
    /// Side job accepted under its key, about to be spawned.
    ///
    /// Sets: `key`.
    SideJobQueued,

    /// Side job body started executing.
    ///
    /// Sets: `key`, restart reason.
    SideJobStarted {
        /// Why this key (re)started.
        restart: RestartReason,
    },

    /// Side job body returned successfully.
    ///
    /// Sets: `key`.
    SideJobCompleted,

    /// Side job was cancelled (restart under the same key, explicit cancel,
    /// or container teardown).
    ///
    /// Sets: `key`.
    SideJobCancelled,

    /// Side job body failed or panicked. Isolated to its key.
    ///
    /// Sets: `key`, `detail` (error message).
    SideJobError,

    // === Container ===
    /// Interceptor worker started and received its injection scope.
    ///
    /// Sets: `key` (interceptor name).
    InterceptorAttached,

    /// Interceptor panicked while consuming a notification; delivery to the
    /// other interceptors is unaffected.
    ///
    /// Sets: `key` (interceptor name), `detail` (panic info).
    InterceptorFailed,

    /// An error escaped all other boundaries, or a handler invocation
    /// returned without any observable effect and without declaring a no-op.
    ///
    /// Sets: `item` (if correlated), `detail`.
    UnhandledError,

    /// The container's lifecycle status changed.
    ///
    /// Sets: the new status.
    StatusChanged {
        /// The status just entered.
        status: Status,
    },
}

impl<M: Machine> NotificationKind<M> {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn label(&self) -> &'static str {
        match self {
            NotificationKind::InputQueued => "input_queued",
            NotificationKind::InputAccepted => "input_accepted",
            NotificationKind::InputRejected => "input_rejected",
            NotificationKind::InputDropped => "input_dropped",
            NotificationKind::InputHandled => "input_handled",
            NotificationKind::InputCancelled => "input_cancelled",
            NotificationKind::InputHandlerError => "input_handler_error",
            NotificationKind::EventQueued => "event_queued",
            NotificationKind::EventEmitted => "event_emitted",
            NotificationKind::EventProcessingStarted => "event_processing_started",
            NotificationKind::EventProcessingStopped => "event_processing_stopped",
            NotificationKind::EventHandled => "event_handled",
            NotificationKind::EventHandlerError => "event_handler_error",
            NotificationKind::StateChanged { .. } => "state_changed",
            NotificationKind::SideJobQueued => "side_job_queued",
            NotificationKind::SideJobStarted { .. } => "side_job_started",
            NotificationKind::SideJobCompleted => "side_job_completed",
            NotificationKind::SideJobCancelled => "side_job_cancelled",
            NotificationKind::SideJobError => "side_job_error",
            NotificationKind::InterceptorAttached => "interceptor_attached",
            NotificationKind::InterceptorFailed => "interceptor_failed",
            NotificationKind::UnhandledError => "unhandled_error",
            NotificationKind::StatusChanged { .. } => "status_changed",
        }
    }
}

impl<M: Machine> Clone for NotificationKind<M> {
    fn clone(&self) -> Self {
        match self {
            NotificationKind::InputQueued => NotificationKind::InputQueued,
            NotificationKind::InputAccepted => NotificationKind::InputAccepted,
            NotificationKind::InputRejected => NotificationKind::InputRejected,
            NotificationKind::InputDropped => NotificationKind::InputDropped,
            NotificationKind::InputHandled => NotificationKind::InputHandled,
            NotificationKind::InputCancelled => NotificationKind::InputCancelled,
            NotificationKind::InputHandlerError => NotificationKind::InputHandlerError,
            NotificationKind::EventQueued => NotificationKind::EventQueued,
            NotificationKind::EventEmitted => NotificationKind::EventEmitted,
            NotificationKind::EventProcessingStarted => NotificationKind::EventProcessingStarted,
            NotificationKind::EventProcessingStopped => NotificationKind::EventProcessingStopped,
            NotificationKind::EventHandled => NotificationKind::EventHandled,
            NotificationKind::EventHandlerError => NotificationKind::EventHandlerError,
            NotificationKind::StateChanged { state } => NotificationKind::StateChanged {
                state: state.clone(),
            },
            NotificationKind::SideJobQueued => NotificationKind::SideJobQueued,
            NotificationKind::SideJobStarted { restart } => {
                NotificationKind::SideJobStarted { restart: *restart }
            }
            NotificationKind::SideJobCompleted => NotificationKind::SideJobCompleted,
            NotificationKind::SideJobCancelled => NotificationKind::SideJobCancelled,
            NotificationKind::SideJobError => NotificationKind::SideJobError,
            NotificationKind::InterceptorAttached => NotificationKind::InterceptorAttached,
            NotificationKind::InterceptorFailed => NotificationKind::InterceptorFailed,
            NotificationKind::UnhandledError => NotificationKind::UnhandledError,
            NotificationKind::StatusChanged { status } => {
                NotificationKind::StatusChanged { status: *status }
            }
        }
    }
}

/// Lifecycle notification with shared metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - `item`: correlation id linking queued/accepted/terminal notifications
///   for one input or event
/// - `key`: side-job key or interceptor name, where applicable
/// - `detail`: human-readable rendering (input/event debug text, errors)
pub struct Notification<M: Machine> {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Item correlation id, if this notification concerns one queued item
    /// or event.
    pub item: Option<u64>,
    /// Side-job key or interceptor name, if applicable.
    pub key: Option<Arc<str>>,
    /// Human-readable detail (payload rendering or error message).
    pub detail: Option<Arc<str>>,
    /// Notification classification.
    pub kind: NotificationKind<M>,
}

impl<M: Machine> Notification<M> {
    /// Creates a new notification of the given kind with the current
    /// timestamp and next sequence number.
    pub fn now(kind: NotificationKind<M>) -> Self {
        Self {
            seq: NOTE_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            item: None,
            key: None,
            detail: None,
            kind,
        }
    }

    /// Attaches an item correlation id.
    #[inline]
    pub fn with_item(mut self, id: u64) -> Self {
        self.item = Some(id);
        self
    }

    /// Attaches a side-job key or interceptor name.
    #[inline]
    pub fn with_key(mut self, key: impl Into<Arc<str>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attaches a human-readable detail.
    #[inline]
    pub fn with_detail(mut self, detail: impl Into<Arc<str>>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// True if this is a terminal input notification (handled, cancelled,
    /// or handler error) for the given item id.
    pub fn is_terminal_for(&self, item: u64) -> bool {
        self.item == Some(item)
            && matches!(
                self.kind,
                NotificationKind::InputHandled
                    | NotificationKind::InputCancelled
                    | NotificationKind::InputHandlerError
                    | NotificationKind::InputDropped
                    | NotificationKind::InputRejected
            )
    }
}

impl<M: Machine> Clone for Notification<M> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            at: self.at,
            item: self.item,
            key: self.key.clone(),
            detail: self.detail.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl<M: Machine> std::fmt::Debug for Notification<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notification")
            .field("seq", &self.seq)
            .field("kind", &self.kind.label())
            .field("item", &self.item)
            .field("key", &self.key)
            .field("detail", &self.detail)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestMachine;

    impl Machine for TestMachine {
        type Input = u32;
        type Event = u32;
        type State = u32;
    }

    #[test]
    fn test_seq_is_monotonic() {
        let a = Notification::<TestMachine>::now(NotificationKind::InputQueued);
        let b = Notification::<TestMachine>::now(NotificationKind::InputAccepted);
        assert!(b.seq > a.seq, "b.seq={} a.seq={}", b.seq, a.seq);
    }

    #[test]
    fn test_builders_set_metadata() {
        let n = Notification::<TestMachine>::now(NotificationKind::SideJobError)
            .with_key("poll")
            .with_detail("boom");
        assert_eq!(n.key.as_deref(), Some("poll"));
        assert_eq!(n.detail.as_deref(), Some("boom"));
        assert_eq!(n.kind.label(), "side_job_error");
    }

    #[test]
    fn test_terminal_matches_item_id() {
        let n = Notification::<TestMachine>::now(NotificationKind::InputHandled).with_item(7);
        assert!(n.is_terminal_for(7));
        assert!(!n.is_terminal_for(8));

        let accepted =
            Notification::<TestMachine>::now(NotificationKind::InputAccepted).with_item(7);
        assert!(!accepted.is_terminal_for(7));
    }
}
