//! # State holder: the single-writer owner of the current value.
//!
//! One dedicated task drains a message queue of read/mutate/rollback
//! requests. Because there is exactly one consumer, every commit is totally
//! ordered regardless of which input strategy (or how many concurrent
//! handlers) submitted it; no locks are involved.
//!
//! ## Architecture
//! ```text
//! InputScope::mutate ──┐
//! InputScope::state  ──┼──► mpsc ──► state loop ──► watch (observe_state)
//! restore/rollback   ──┘                       └──► Bus: StateChanged
//! ```
//!
//! ## Rules
//! - Commits are published in commit order; observers never see a skipped
//!   or reordered value.
//! - `rollback` force-sets without re-deriving; it is used when a handler
//!   fails after partially mutating state, and for restore items.
//! - The loop exits when the runtime token is cancelled or all request
//!   senders are gone.

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::ContainerError;
use crate::machine::Machine;
use crate::notifications::{Bus, Notification, NotificationKind};

/// A state transformation submitted through [`StateHolder::mutate`].
pub(crate) type Transform<M> =
    Box<dyn FnOnce(<M as Machine>::State) -> <M as Machine>::State + Send>;

enum StateMsg<M: Machine> {
    Read(oneshot::Sender<M::State>),
    Mutate {
        transform: Transform<M>,
        reply: oneshot::Sender<M::State>,
    },
    Rollback {
        state: M::State,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the state actor. Cheap to clone; all clones feed the same
/// single-consumer loop.
pub(crate) struct StateHolder<M: Machine> {
    tx: mpsc::Sender<StateMsg<M>>,
    observe: watch::Receiver<M::State>,
}

impl<M: Machine> Clone for StateHolder<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            observe: self.observe.clone(),
        }
    }
}

impl<M: Machine> StateHolder<M> {
    /// Spawns the state actor with the given initial value.
    pub(crate) fn spawn(initial: M::State, bus: Bus<M>, token: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<StateMsg<M>>(64);
        let (watch_tx, watch_rx) = watch::channel(initial.clone());

        tokio::spawn(async move {
            let mut current = initial;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        None => break,
                        Some(StateMsg::Read(reply)) => {
                            let _ = reply.send(current.clone());
                        }
                        Some(StateMsg::Mutate { transform, reply }) => {
                            current = transform(current);
                            Self::commit(&watch_tx, &bus, &current);
                            let _ = reply.send(current.clone());
                        }
                        Some(StateMsg::Rollback { state, reply }) => {
                            current = state;
                            Self::commit(&watch_tx, &bus, &current);
                            let _ = reply.send(());
                        }
                    }
                }
            }
        });

        Self {
            tx,
            observe: watch_rx,
        }
    }

    fn commit(watch_tx: &watch::Sender<M::State>, bus: &Bus<M>, value: &M::State) {
        watch_tx.send_replace(value.clone());
        bus.publish(Notification::now(NotificationKind::StateChanged {
            state: value.clone(),
        }));
    }

    /// Returns the current value.
    pub(crate) async fn read(&self) -> Result<M::State, ContainerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StateMsg::Read(reply))
            .await
            .map_err(|_| ContainerError::QueueClosed)?;
        rx.await.map_err(|_| ContainerError::QueueClosed)
    }

    /// Computes `transform(current)`, commits atomically, and returns the
    /// new value.
    pub(crate) async fn mutate(&self, transform: Transform<M>) -> Result<M::State, ContainerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StateMsg::Mutate { transform, reply })
            .await
            .map_err(|_| ContainerError::QueueClosed)?;
        rx.await.map_err(|_| ContainerError::QueueClosed)
    }

    /// Force-sets the value without re-deriving.
    pub(crate) async fn rollback(&self, state: M::State) -> Result<(), ContainerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StateMsg::Rollback { state, reply })
            .await
            .map_err(|_| ContainerError::QueueClosed)?;
        rx.await.map_err(|_| ContainerError::QueueClosed)
    }

    /// Subscription to committed values, in commit order.
    pub(crate) fn observe(&self) -> watch::Receiver<M::State> {
        self.observe.clone()
    }
}
