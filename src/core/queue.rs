//! # Input intake and the strategy-driven processing loop.
//!
//! Inputs enter through [`Intake`], which gate-checks the live status,
//! reserves queue capacity, and publishes admission notifications. A single
//! worker task drains the queue under one of three ordering strategies.
//!
//! ## Architecture
//! ```text
//! send / try_send_now / post_input ──► Intake ──► mpsc ──► strategy loop
//!                                        │                     │
//!                                        │              ┌──────┴──────┐
//!                                        ▼              ▼      ▼      ▼
//!                                       Bus           Fifo  Latest  Parallel
//!                                                       │
//!                                                       ▼
//!                                                 process_item:
//!                                                 snapshot → handler →
//!                                                 handled / rollback /
//!                                                 cancelled
//! ```
//!
//! ## Rules
//! - Admission order is the notification order: `InputQueued` always
//!   precedes that item's `InputAccepted`.
//! - Every admitted item resolves to exactly one terminal notification
//!   (handled, cancelled, or handler error), and its completion resolves
//!   with the matching result.
//! - A failing handler rolls state back to the snapshot taken when its
//!   invocation started; a cancelled handler keeps its committed mutations.
//! - `Latest` cancels and joins the in-flight item before accepting the
//!   next one, so the preempted item's terminal notification comes first.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::core::dispatch::EventMsg;
use crate::core::guard::{Guard, InputScope};
use crate::core::sidejobs::SideJobSupervisor;
use crate::core::state::StateHolder;
use crate::core::status::Status;
use crate::error::{panic_text, ContainerError, HandlerError};
use crate::machine::{EventHandler, Handler, Machine};
use crate::notifications::{next_item_id, Bus, Notification, NotificationKind};

/// Ordering discipline applied by the input worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStrategy {
    /// Strict serialization: one item at a time, in admission order.
    Fifo,

    /// Newest wins: an incoming item cancels the in-flight one, which is
    /// joined before the new item starts.
    Latest,

    /// No ordering: every item gets its own task immediately.
    Parallel,
}

impl InputStrategy {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            InputStrategy::Fifo => "fifo",
            InputStrategy::Latest => "latest",
            InputStrategy::Parallel => "parallel",
        }
    }
}

/// Resolves the submitter's completion future, if one was attached.
pub(crate) type Completion = oneshot::Sender<Result<(), ContainerError>>;

pub(crate) fn resolve(done: Option<Completion>, result: Result<(), ContainerError>) {
    if let Some(tx) = done {
        let _ = tx.send(result);
    }
}

/// One unit of work for the input queue.
///
/// Regular inputs run the attached handler; restore items force-set the
/// state without invoking it. Both travel the same queue and obey the same
/// ordering strategy.
pub struct QueuedItem<M: Machine> {
    inner: ItemInner<M>,
}

enum ItemInner<M: Machine> {
    HandleInput {
        id: u64,
        input: M::Input,
        done: Option<Completion>,
    },
    RestoreState {
        id: u64,
        state: M::State,
        done: Option<Completion>,
    },
}

impl<M: Machine> QueuedItem<M> {
    /// An input to be processed by the attached handler.
    pub fn input(input: M::Input) -> Self {
        Self {
            inner: ItemInner::HandleInput {
                id: next_item_id(),
                input,
                done: None,
            },
        }
    }

    /// A state value to force-set, bypassing the handler.
    pub fn restore(state: M::State) -> Self {
        Self {
            inner: ItemInner::RestoreState {
                id: next_item_id(),
                state,
                done: None,
            },
        }
    }

    pub(crate) fn input_with_completion(input: M::Input, done: Completion) -> Self {
        Self {
            inner: ItemInner::HandleInput {
                id: next_item_id(),
                input,
                done: Some(done),
            },
        }
    }

    pub(crate) fn restore_with_completion(state: M::State, done: Completion) -> Self {
        Self {
            inner: ItemInner::RestoreState {
                id: next_item_id(),
                state,
                done: Some(done),
            },
        }
    }

    /// Correlation id linking this item's notifications.
    pub fn id(&self) -> u64 {
        match &self.inner {
            ItemInner::HandleInput { id, .. } | ItemInner::RestoreState { id, .. } => *id,
        }
    }

    fn describe(&self) -> String {
        match &self.inner {
            ItemInner::HandleInput { input, .. } => format!("{input:?}"),
            ItemInner::RestoreState { .. } => "restore_state".to_string(),
        }
    }

    /// Resolves the completion (if any) with `err` without processing.
    fn fail(self, err: ContainerError) {
        match self.inner {
            ItemInner::HandleInput { done, .. } | ItemInner::RestoreState { done, .. } => {
                resolve(done, Err(err));
            }
        }
    }
}

/// Message on the input channel. `Drain` is a barrier: acking it proves
/// every item admitted before it has fully processed.
pub(crate) enum InputMsg<M: Machine> {
    Item(QueuedItem<M>),
    Drain(oneshot::Sender<()>),
}

/// Front door for inputs and events. Cheap to clone; shared by the public
/// API, event handlers, and side-job scopes so all of them pass the same
/// gates.
pub(crate) struct Intake<M: Machine> {
    inputs: mpsc::Sender<InputMsg<M>>,
    events: mpsc::Sender<EventMsg<M>>,
    status: watch::Receiver<Status>,
    bus: Bus<M>,
}

impl<M: Machine> Clone for Intake<M> {
    fn clone(&self) -> Self {
        Self {
            inputs: self.inputs.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl<M: Machine> Intake<M> {
    pub(crate) fn new(
        inputs: mpsc::Sender<InputMsg<M>>,
        events: mpsc::Sender<EventMsg<M>>,
        status: watch::Receiver<Status>,
        bus: Bus<M>,
    ) -> Self {
        Self {
            inputs,
            events,
            status,
            bus,
        }
    }

    /// Snapshot of the live status.
    pub(crate) fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Admits an item, waiting for queue capacity. Returns the item id.
    pub(crate) async fn submit(&self, item: QueuedItem<M>) -> Result<u64, ContainerError> {
        let id = item.id();
        if let Err(err) = self.status().check_accept_input() {
            self.bus.publish(
                Notification::now(NotificationKind::InputDropped)
                    .with_item(id)
                    .with_detail(err.to_string()),
            );
            item.fail(err.clone());
            return Err(err);
        }

        let permit = match self.inputs.reserve().await {
            Ok(permit) => permit,
            Err(_) => {
                item.fail(ContainerError::QueueClosed);
                return Err(ContainerError::QueueClosed);
            }
        };

        self.bus.publish(
            Notification::now(NotificationKind::InputQueued)
                .with_item(id)
                .with_detail(item.describe()),
        );
        permit.send(InputMsg::Item(item));
        Ok(id)
    }

    /// Admits an item only if queue capacity is immediately available.
    pub(crate) fn try_submit(&self, item: QueuedItem<M>) -> Result<u64, ContainerError> {
        let id = item.id();
        if let Err(err) = self.status().check_accept_input() {
            self.bus.publish(
                Notification::now(NotificationKind::InputDropped)
                    .with_item(id)
                    .with_detail(err.to_string()),
            );
            item.fail(err.clone());
            return Err(err);
        }

        let permit = match self.inputs.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                self.bus.publish(
                    Notification::now(NotificationKind::InputRejected)
                        .with_item(id)
                        .with_detail(ContainerError::QueueFull.to_string()),
                );
                item.fail(ContainerError::QueueFull);
                return Err(ContainerError::QueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                item.fail(ContainerError::QueueClosed);
                return Err(ContainerError::QueueClosed);
            }
        };

        self.bus.publish(
            Notification::now(NotificationKind::InputQueued)
                .with_item(id)
                .with_detail(item.describe()),
        );
        permit.send(InputMsg::Item(item));
        Ok(id)
    }

    /// Posts an event into the dispatcher's FIFO queue. Returns the event's
    /// correlation id.
    pub(crate) async fn post_event(
        &self,
        event: M::Event,
        done: Option<Completion>,
    ) -> Result<u64, ContainerError> {
        let id = next_item_id();
        if let Err(err) = self.status().check_post_event() {
            resolve(done, Err(err.clone()));
            return Err(err);
        }

        let permit = match self.events.reserve().await {
            Ok(permit) => permit,
            Err(_) => {
                resolve(done, Err(ContainerError::QueueClosed));
                return Err(ContainerError::QueueClosed);
            }
        };

        self.bus.publish(
            Notification::now(NotificationKind::EventQueued)
                .with_item(id)
                .with_detail(format!("{event:?}")),
        );
        permit.send(EventMsg::Post { id, event, done });
        Ok(id)
    }

    /// Sends a drain barrier and waits for the worker to ack it, proving
    /// the queue processed everything admitted before the barrier.
    pub(crate) async fn drain_inputs(&self) -> Result<(), ContainerError> {
        let (ack, done) = oneshot::channel();
        self.inputs
            .send(InputMsg::Drain(ack))
            .await
            .map_err(|_| ContainerError::QueueClosed)?;
        done.await.map_err(|_| ContainerError::QueueClosed)
    }

    /// Attaches the one external event handler. Management control; not
    /// subject to the event gate. Acks only after the buffered backlog has
    /// flushed to the new handler.
    pub(crate) async fn attach_event_handler(
        &self,
        handler: Arc<dyn EventHandler<M>>,
    ) -> Result<(), ContainerError> {
        let (ack, done) = oneshot::channel();
        self.events
            .send(EventMsg::Attach { handler, ack })
            .await
            .map_err(|_| ContainerError::QueueClosed)?;
        done.await.map_err(|_| ContainerError::QueueClosed)?
    }

    /// Detaches the event handler, if any. Returns whether one was attached.
    pub(crate) async fn detach_event_handler(&self) -> Result<bool, ContainerError> {
        let (ack, done) = oneshot::channel();
        self.events
            .send(EventMsg::Detach { ack })
            .await
            .map_err(|_| ContainerError::QueueClosed)?;
        done.await.map_err(|_| ContainerError::QueueClosed)
    }

    /// Drain barrier for the event queue: acks once every event posted
    /// before it has been delivered (or buffered, when no handler is
    /// attached).
    pub(crate) async fn drain_events(&self) -> Result<(), ContainerError> {
        let (ack, done) = oneshot::channel();
        self.events
            .send(EventMsg::Drain(ack))
            .await
            .map_err(|_| ContainerError::QueueClosed)?;
        done.await.map_err(|_| ContainerError::QueueClosed)
    }
}

/// Everything a handler invocation needs, shared by all strategy loops.
pub(crate) struct ProcessCtx<M: Machine> {
    pub(crate) handler: Arc<dyn Handler<M>>,
    pub(crate) state: StateHolder<M>,
    pub(crate) sidejobs: SideJobSupervisor<M>,
    pub(crate) intake: Intake<M>,
    pub(crate) bus: Bus<M>,
}

/// Spawns the input worker for the configured strategy.
pub(crate) fn spawn_input_worker<M: Machine>(
    strategy: InputStrategy,
    rx: mpsc::Receiver<InputMsg<M>>,
    ctx: Arc<ProcessCtx<M>>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match strategy {
            InputStrategy::Fifo => run_fifo(rx, ctx, token).await,
            InputStrategy::Latest => run_latest(rx, ctx, token).await,
            InputStrategy::Parallel => run_parallel(rx, ctx, token).await,
        }
    })
}

async fn run_fifo<M: Machine>(
    mut rx: mpsc::Receiver<InputMsg<M>>,
    ctx: Arc<ProcessCtx<M>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                None => break,
                Some(InputMsg::Drain(ack)) => {
                    let _ = ack.send(());
                }
                Some(InputMsg::Item(item)) => {
                    process_item(&ctx, item, token.child_token()).await;
                }
            }
        }
    }
    cancel_pending(&mut rx, &ctx.bus);
}

async fn run_latest<M: Machine>(
    mut rx: mpsc::Receiver<InputMsg<M>>,
    ctx: Arc<ProcessCtx<M>>,
    token: CancellationToken,
) {
    let mut active: Option<(CancellationToken, JoinHandle<()>)> = None;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                None => break,
                Some(InputMsg::Drain(ack)) => {
                    if let Some((_cancel, join)) = active.take() {
                        let _ = join.await;
                    }
                    let _ = ack.send(());
                }
                Some(InputMsg::Item(item)) => {
                    // Preempt: cancel the in-flight item and join it so its
                    // terminal notification precedes the new item's start.
                    if let Some((cancel, join)) = active.take() {
                        cancel.cancel();
                        let _ = join.await;
                    }
                    let child = token.child_token();
                    let task_ctx = Arc::clone(&ctx);
                    let task_token = child.clone();
                    let join = tokio::spawn(async move {
                        process_item(&task_ctx, item, task_token).await;
                    });
                    active = Some((child, join));
                }
            }
        }
    }
    if let Some((cancel, join)) = active.take() {
        cancel.cancel();
        let _ = join.await;
    }
    cancel_pending(&mut rx, &ctx.bus);
}

async fn run_parallel<M: Machine>(
    mut rx: mpsc::Receiver<InputMsg<M>>,
    ctx: Arc<ProcessCtx<M>>,
    token: CancellationToken,
) {
    let mut inflight: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            msg = rx.recv() => match msg {
                None => break,
                Some(InputMsg::Drain(ack)) => {
                    while inflight.join_next().await.is_some() {}
                    let _ = ack.send(());
                }
                Some(InputMsg::Item(item)) => {
                    let task_ctx = Arc::clone(&ctx);
                    let task_token = token.child_token();
                    inflight.spawn(async move {
                        process_item(&task_ctx, item, task_token).await;
                    });
                }
            }
        }
    }
    // Teardown cancelled the child tokens; wait for terminal notifications.
    while inflight.join_next().await.is_some() {}
    cancel_pending(&mut rx, &ctx.bus);
}

/// Resolves everything still sitting in the queue as cancelled.
fn cancel_pending<M: Machine>(rx: &mut mpsc::Receiver<InputMsg<M>>, bus: &Bus<M>) {
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            InputMsg::Drain(ack) => {
                let _ = ack.send(());
            }
            InputMsg::Item(item) => {
                bus.publish(
                    Notification::now(NotificationKind::InputCancelled).with_item(item.id()),
                );
                item.fail(ContainerError::Cancelled);
            }
        }
    }
}

/// Runs one queued item to its terminal notification.
async fn process_item<M: Machine>(
    ctx: &Arc<ProcessCtx<M>>,
    item: QueuedItem<M>,
    cancel: CancellationToken,
) {
    let id = item.id();
    let detail = item.describe();
    match item.inner {
        ItemInner::RestoreState { state, done, .. } => {
            ctx.bus.publish(
                Notification::now(NotificationKind::InputAccepted)
                    .with_item(id)
                    .with_detail(detail),
            );
            match ctx.state.rollback(state).await {
                Ok(()) => {
                    ctx.bus
                        .publish(Notification::now(NotificationKind::InputHandled).with_item(id));
                    resolve(done, Ok(()));
                }
                Err(err) => {
                    ctx.bus
                        .publish(Notification::now(NotificationKind::InputCancelled).with_item(id));
                    resolve(done, Err(err));
                }
            }
        }
        ItemInner::HandleInput { input, done, .. } => {
            ctx.bus.publish(
                Notification::now(NotificationKind::InputAccepted)
                    .with_item(id)
                    .with_detail(detail),
            );

            // Snapshot for rollback-on-failure.
            let snapshot = match ctx.state.read().await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    ctx.bus
                        .publish(Notification::now(NotificationKind::InputCancelled).with_item(id));
                    resolve(done, Err(err));
                    return;
                }
            };

            let guard = Guard::new();
            let mut scope = InputScope::new(
                guard.clone(),
                id,
                ctx.state.clone(),
                ctx.sidejobs.clone(),
                ctx.intake.clone(),
            );
            let handler = Arc::clone(&ctx.handler);
            let fut = std::panic::AssertUnwindSafe(async move {
                handler.handle(&mut scope, input).await
            })
            .catch_unwind();
            tokio::pin!(fut);

            // Cancellation takes effect at the handler's suspension points;
            // mutations committed before that point are kept.
            let outcome = tokio::select! {
                biased;
                res = &mut fut => Some(res),
                _ = cancel.cancelled() => None,
            };
            guard.close();

            match outcome {
                None | Some(Ok(Err(HandlerError::Canceled))) => {
                    ctx.bus
                        .publish(Notification::now(NotificationKind::InputCancelled).with_item(id));
                    resolve(done, Err(ContainerError::Cancelled));
                }
                Some(Ok(Ok(()))) => {
                    if !guard.was_used() {
                        ctx.bus.publish(
                            Notification::now(NotificationKind::UnhandledError)
                                .with_item(id)
                                .with_detail(
                                    "handler returned without effects and without declaring a no-op",
                                ),
                        );
                    }
                    ctx.bus
                        .publish(Notification::now(NotificationKind::InputHandled).with_item(id));
                    resolve(done, Ok(()));
                }
                Some(Ok(Err(err))) => {
                    // `Canceled` was consumed above; render the failure the
                    // same way the error itself displays.
                    let error = err.to_string();
                    let _ = ctx.state.rollback(snapshot).await;
                    ctx.bus.publish(
                        Notification::now(NotificationKind::InputHandlerError)
                            .with_item(id)
                            .with_detail(error.clone()),
                    );
                    resolve(done, Err(ContainerError::HandlerFailed { error }));
                }
                Some(Err(panic)) => {
                    let error = format!("handler panicked: {}", panic_text(&*panic));
                    let _ = ctx.state.rollback(snapshot).await;
                    ctx.bus.publish(
                        Notification::now(NotificationKind::InputHandlerError)
                            .with_item(id)
                            .with_detail(error.clone()),
                    );
                    resolve(done, Err(ContainerError::HandlerFailed { error }));
                }
            }
        }
    }
}
