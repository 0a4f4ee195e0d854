//! # Event dispatcher: strict-FIFO delivery to one attached handler.
//!
//! Events are one-shot notifications for an external consumer. The
//! dispatcher is a single task draining one channel, so delivery order is
//! exactly post order regardless of which input strategy produced the
//! events. Events posted while no handler is attached buffer in memory and
//! flush, still in order, when one attaches.
//!
//! ## Architecture
//! ```text
//! post_event ──► mpsc ──► dispatcher ──► attached EventHandler
//!                            │   │
//!                            │   └─ no handler: VecDeque buffer
//!                            ▼
//!                           Bus: Queued, Emitted, ProcessingStarted/
//!                                Stopped, Handled / HandlerError
//! ```
//!
//! ## Rules
//! - At most one handler at a time; a second attach fails, it never
//!   silently replaces.
//! - A handler failure (or panic) is reported and the loop continues with
//!   the next event.
//! - `Drain` acks only after every event posted before it was delivered
//!   (or immediately when no handler is attached).
//! - Teardown resolves buffered and queued events as cancelled.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::guard::EventScope;
use crate::core::queue::{resolve, Completion, Intake};
use crate::error::{panic_text, ContainerError};
use crate::machine::{EventHandler, Machine};
use crate::notifications::{Bus, Notification, NotificationKind};

/// Message on the event channel. Control messages (attach, detach, drain)
/// ride the same FIFO channel as events, so they observe everything posted
/// before them.
pub(crate) enum EventMsg<M: Machine> {
    Post {
        id: u64,
        event: M::Event,
        done: Option<Completion>,
    },
    Attach {
        handler: Arc<dyn EventHandler<M>>,
        ack: oneshot::Sender<Result<(), ContainerError>>,
    },
    Detach {
        ack: oneshot::Sender<bool>,
    },
    Drain(oneshot::Sender<()>),
}

/// Spawns the dispatcher task, optionally with a handler attached from the
/// start.
pub(crate) fn spawn_dispatcher<M: Machine>(
    rx: mpsc::Receiver<EventMsg<M>>,
    intake: Intake<M>,
    bus: Bus<M>,
    token: CancellationToken,
    initial: Option<Arc<dyn EventHandler<M>>>,
) -> JoinHandle<()> {
    tokio::spawn(run_dispatcher(rx, intake, bus, token, initial))
}

async fn run_dispatcher<M: Machine>(
    mut rx: mpsc::Receiver<EventMsg<M>>,
    intake: Intake<M>,
    bus: Bus<M>,
    token: CancellationToken,
    initial: Option<Arc<dyn EventHandler<M>>>,
) {
    let scope = EventScope::new(intake);
    let mut handler: Option<Arc<dyn EventHandler<M>>> = initial;
    // Holds events posted while no handler is attached.
    let mut buffer: VecDeque<(u64, M::Event, Option<Completion>)> = VecDeque::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                None => break,
                Some(EventMsg::Post { id, event, done }) => match &handler {
                    Some(h) => deliver(h, &scope, &bus, id, event, done).await,
                    None => buffer.push_back((id, event, done)),
                },
                Some(EventMsg::Attach { handler: new, ack }) => {
                    if handler.is_some() {
                        let _ = ack.send(Err(ContainerError::HandlerAlreadyAttached));
                        continue;
                    }
                    // Flush the backlog in post order before acking, so the
                    // caller observes a caught-up dispatcher.
                    while let Some((id, event, done)) = buffer.pop_front() {
                        deliver(&new, &scope, &bus, id, event, done).await;
                    }
                    handler = Some(new);
                    let _ = ack.send(Ok(()));
                }
                Some(EventMsg::Detach { ack }) => {
                    let _ = ack.send(handler.take().is_some());
                }
                Some(EventMsg::Drain(ack)) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    // Teardown: everything undelivered resolves as cancelled.
    for (_id, _event, done) in buffer.drain(..) {
        resolve(done, Err(ContainerError::Cancelled));
    }
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            EventMsg::Post { done, .. } => resolve(done, Err(ContainerError::Cancelled)),
            EventMsg::Attach { ack, .. } => {
                let _ = ack.send(Err(ContainerError::QueueClosed));
            }
            EventMsg::Detach { ack } => {
                let _ = ack.send(false);
            }
            EventMsg::Drain(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// Delivers one event to the attached handler and reports the outcome.
async fn deliver<M: Machine>(
    handler: &Arc<dyn EventHandler<M>>,
    scope: &EventScope<M>,
    bus: &Bus<M>,
    id: u64,
    event: M::Event,
    done: Option<Completion>,
) {
    bus.publish(
        Notification::now(NotificationKind::EventEmitted)
            .with_item(id)
            .with_detail(format!("{event:?}")),
    );
    bus.publish(Notification::now(NotificationKind::EventProcessingStarted).with_item(id));

    let res = std::panic::AssertUnwindSafe(handler.on_event(scope, event))
        .catch_unwind()
        .await;

    bus.publish(Notification::now(NotificationKind::EventProcessingStopped).with_item(id));
    match res {
        Ok(Ok(())) => {
            bus.publish(Notification::now(NotificationKind::EventHandled).with_item(id));
            resolve(done, Ok(()));
        }
        Ok(Err(err)) if err.is_cancellation() => {
            bus.publish(
                Notification::now(NotificationKind::EventHandlerError)
                    .with_item(id)
                    .with_detail(err.to_string()),
            );
            resolve(done, Err(ContainerError::Cancelled));
        }
        Ok(Err(err)) => {
            let error = err.to_string();
            bus.publish(
                Notification::now(NotificationKind::EventHandlerError)
                    .with_item(id)
                    .with_detail(error.clone()),
            );
            resolve(done, Err(ContainerError::HandlerFailed { error }));
        }
        Err(panic) => {
            let error = format!("event handler panicked: {}", panic_text(&*panic));
            bus.publish(
                Notification::now(NotificationKind::EventHandlerError)
                    .with_item(id)
                    .with_detail(error.clone()),
            );
            resolve(done, Err(ContainerError::HandlerFailed { error }));
        }
    }
}
