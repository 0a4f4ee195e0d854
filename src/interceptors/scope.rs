//! Injection scope handed to interceptors.

use crate::core::queue::{Intake, QueuedItem};
use crate::error::ContainerError;
use crate::machine::Machine;

/// # Re-entry path for interceptors.
///
/// Everything injected here passes the same lifecycle gates and admission
/// notifications as inputs and events submitted through the public API.
pub struct InterceptorScope<M: Machine> {
    intake: Intake<M>,
}

impl<M: Machine> Clone for InterceptorScope<M> {
    fn clone(&self) -> Self {
        Self {
            intake: self.intake.clone(),
        }
    }
}

impl<M: Machine> InterceptorScope<M> {
    pub(crate) fn new(intake: Intake<M>) -> Self {
        Self { intake }
    }

    /// Enqueues an input. Returns the item's correlation id.
    pub async fn inject_input(&self, input: M::Input) -> Result<u64, ContainerError> {
        self.intake.submit(QueuedItem::input(input)).await
    }

    /// Enqueues a state restore, bypassing the input handler.
    pub async fn inject_restore(&self, state: M::State) -> Result<u64, ContainerError> {
        self.intake.submit(QueuedItem::restore(state)).await
    }

    /// Posts an event. Returns the event's correlation id.
    pub async fn inject_event(&self, event: M::Event) -> Result<u64, ContainerError> {
        self.intake.post_event(event, None).await
    }
}
