//! # Guard: the per-invocation capability gate.
//!
//! Every queued item is processed under a fresh [`Guard`]. The guard is
//! "open" while the handler invocation runs and transitions irreversibly to
//! "closed" the instant the invocation returns (normally, with an error, or
//! by cancellation). Every capability on [`InputScope`] checks the guard
//! first, which catches handlers that illegally retain their invocation
//! scope and reuse it from another task.
//!
//! ## Rules
//! - Open → closed is one-way; there is no reopen.
//! - A closed guard fails fast with the violated capability's name.
//! - The guard also tracks whether the invocation had any observable effect
//!   (or declared itself a no-op), so the queue can flag inputs that were
//!   silently ignored.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use std::future::Future;

use crate::core::queue::{Intake, QueuedItem};
use crate::core::sidejobs::{SideJobScope, SideJobSupervisor};
use crate::core::state::StateHolder;
use crate::error::{ContainerError, HandlerError};
use crate::machine::Machine;

/// Per-invocation gate shared between the queue (which closes it) and the
/// scope (which checks it).
#[derive(Clone)]
pub(crate) struct Guard {
    flags: Arc<GuardFlags>,
}

struct GuardFlags {
    closed: AtomicBool,
    used: AtomicBool,
}

impl Guard {
    pub(crate) fn new() -> Self {
        Self {
            flags: Arc::new(GuardFlags {
                closed: AtomicBool::new(false),
                used: AtomicBool::new(false),
            }),
        }
    }

    /// Fails fast if the guard has already closed.
    pub(crate) fn ensure_open(&self, operation: &'static str) -> Result<(), ContainerError> {
        if self.flags.closed.load(AtomicOrdering::Acquire) {
            return Err(ContainerError::GuardClosed { operation });
        }
        Ok(())
    }

    /// Closes the guard irreversibly. Called by the queue when the handler
    /// invocation returns, however it returns.
    pub(crate) fn close(&self) {
        self.flags.closed.store(true, AtomicOrdering::Release);
    }

    /// Records that the invocation performed an observable effect.
    pub(crate) fn mark_used(&self) {
        self.flags.used.store(true, AtomicOrdering::Release);
    }

    /// True if any effect was performed or a no-op was declared.
    pub(crate) fn was_used(&self) -> bool {
        self.flags.used.load(AtomicOrdering::Acquire)
    }
}

/// # Capability scope handed to an input handler.
///
/// All handler-visible side effects go through this scope, and every call
/// is gated twice: by the invocation's [`Guard`] and by the live container
/// status. Constructed fresh per queued item; unusable once the invocation
/// returns.
pub struct InputScope<M: Machine> {
    guard: Guard,
    item: u64,
    state: StateHolder<M>,
    sidejobs: SideJobSupervisor<M>,
    intake: Intake<M>,
}

impl<M: Machine> InputScope<M> {
    pub(crate) fn new(
        guard: Guard,
        item: u64,
        state: StateHolder<M>,
        sidejobs: SideJobSupervisor<M>,
        intake: Intake<M>,
    ) -> Self {
        Self {
            guard,
            item,
            state,
            sidejobs,
            intake,
        }
    }

    /// The correlation id of the item this invocation is processing.
    pub fn item(&self) -> u64 {
        self.item
    }

    /// Reads the current state value.
    pub async fn state(&self) -> Result<M::State, ContainerError> {
        self.guard.ensure_open("state")?;
        self.state.read().await
    }

    /// Computes `transform(current)`, commits atomically, and returns the
    /// new value. A mutation that reaches the state holder always commits;
    /// cancellation never rolls it back.
    pub async fn mutate<F>(&mut self, transform: F) -> Result<M::State, ContainerError>
    where
        F: FnOnce(M::State) -> M::State + Send + 'static,
    {
        self.guard.ensure_open("mutate")?;
        self.intake.status().check_mutate_state()?;
        self.guard.mark_used();
        self.state.mutate(Box::new(transform)).await
    }

    /// Posts a one-shot event for the attached external handler.
    pub async fn post_event(&mut self, event: M::Event) -> Result<(), ContainerError> {
        self.guard.ensure_open("post_event")?;
        self.guard.mark_used();
        self.intake.post_event(event, None).await.map(|_| ())
    }

    /// Starts (or restarts) a supervised side job under `key`.
    ///
    /// If a job is already running under the same key it is cancelled
    /// cooperatively before the new body is launched.
    pub async fn start_side_job<F, Fut>(
        &mut self,
        key: impl Into<String>,
        body: F,
    ) -> Result<(), ContainerError>
    where
        F: FnOnce(SideJobScope<M>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.guard.ensure_open("start_side_job")?;
        self.intake.status().check_start_side_job()?;
        self.guard.mark_used();
        self.sidejobs
            .start(key.into(), Box::new(move |scope| Box::pin(body(scope))))
            .await;
        Ok(())
    }

    /// Cancels the side job under `key`, if any. No-op when absent.
    pub async fn cancel_side_job(&mut self, key: &str) -> Result<(), ContainerError> {
        self.guard.ensure_open("cancel_side_job")?;
        self.intake.status().check_cancel_side_job()?;
        self.guard.mark_used();
        self.sidejobs.cancel(key).await;
        Ok(())
    }

    /// Declares that this input intentionally has no effects, silencing the
    /// unhandled-input diagnostic.
    pub fn declare_no_op(&mut self) -> Result<(), ContainerError> {
        self.guard.ensure_open("declare_no_op")?;
        self.guard.mark_used();
        Ok(())
    }
}

/// # Capability scope handed to the attached event handler.
///
/// Event handlers may feed inputs back into the container but hold no
/// state-mutation rights.
pub struct EventScope<M: Machine> {
    intake: Intake<M>,
}

impl<M: Machine> EventScope<M> {
    pub(crate) fn new(intake: Intake<M>) -> Self {
        Self { intake }
    }

    /// Enqueues an input, subject to the same lifecycle gates as the public
    /// API.
    pub async fn post_input(&self, input: M::Input) -> Result<(), ContainerError> {
        self.intake.submit(QueuedItem::input(input)).await.map(|_| ())
    }
}
