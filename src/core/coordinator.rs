//! # Container coordinator: lifecycle, admission, and ordered teardown.
//!
//! [`Container`] is the owning handle for one state container. It wires
//! the actors together at build time, flips the status watch, and runs the
//! five-phase graceful shutdown.
//!
//! ## Architecture
//! ```text
//!                 ┌────────────────────────────────────────────┐
//!  send ─────────►│ Intake ──► input worker ──► StateHolder    │
//!  post_event ───►│        └─► dispatcher  ──► EventHandler    │
//!  side jobs ◄────┤ SideJobSupervisor                          │
//!                 │     Bus ──► interceptor fan-out            │
//!                 └────────────────────────────────────────────┘
//!                        ▲
//!                 status watch (gates every admission)
//! ```
//!
//! ## Shutdown order
//! `request_shutdown` closes the gates in a fixed order, draining between
//! phases so nothing admitted before a gate closed is lost:
//! 1. input gate closes, the input queue drains;
//! 2. event gate closes, the event queue drains;
//! 3. new side jobs are refused;
//! 4. manual side-job cancellation is refused, then all side jobs are
//!    cancelled and awaited up to the configured grace;
//! 5. state changes close; the container becomes `Cleared`.
//!
//! The final `Cleared` status change is published before the runtime token
//! cancels, and the interceptor listener drains its backlog after the
//! cancel, so interceptors always observe the terminal status.

use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::config::Config;
use crate::core::dispatch::spawn_dispatcher;
use crate::core::queue::{spawn_input_worker, Intake, ProcessCtx, QueuedItem};
use crate::core::sidejobs::{ObserverRegistry, SideJobSupervisor};
use crate::core::state::StateHolder;
use crate::core::status::Status;
use crate::error::ContainerError;
use crate::interceptors::{Intercept, InterceptorScope, InterceptorSet};
use crate::machine::{EventHandler, Handler, Machine};
use crate::notifications::{Bus, Notification, NotificationKind};

type FanoutHandle<M> = JoinHandle<InterceptorSet<M>>;

/// Owning handle for one running state container.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Container<M: Machine> {
    cfg: Config,
    bus: Bus<M>,
    intake: Intake<M>,
    state: StateHolder<M>,
    sidejobs: SideJobSupervisor<M>,
    status_tx: watch::Sender<Status>,
    runtime_token: CancellationToken,
    /// Serializes lifecycle transitions and owns the fan-out listener
    /// until teardown reclaims it.
    lifecycle: Mutex<Option<FanoutHandle<M>>>,
}

impl<M: Machine> Container<M> {
    /// Wires and spawns all actors. The container starts gated as
    /// `NotStarted`; call [`Container::start`] to begin accepting work.
    pub(crate) fn build(
        cfg: Config,
        initial: M::State,
        handler: Arc<dyn Handler<M>>,
        event_handler: Option<Arc<dyn EventHandler<M>>>,
        interceptors: Vec<Arc<dyn Intercept<M>>>,
    ) -> Self {
        let bus: Bus<M> = Bus::new(cfg.bus_capacity_clamped());
        let runtime_token = CancellationToken::new();
        let (inputs_tx, inputs_rx) = tokio::sync::mpsc::channel(cfg.inputs_capacity_clamped());
        let (events_tx, events_rx) = tokio::sync::mpsc::channel(cfg.events_capacity_clamped());
        let (status_tx, status_rx) = watch::channel(Status::NotStarted);

        let intake = Intake::new(inputs_tx, events_tx, status_rx, bus.clone());
        let state = StateHolder::spawn(initial, bus.clone(), runtime_token.clone());
        let observers: ObserverRegistry<M> = Arc::new(
            interceptors
                .iter()
                .map(|i| (i.name().to_string(), Arc::clone(i)))
                .collect(),
        );
        let sidejobs = SideJobSupervisor::new(
            bus.clone(),
            runtime_token.clone(),
            intake.clone(),
            observers,
        );

        let ctx = Arc::new(ProcessCtx {
            handler,
            state: state.clone(),
            sidejobs: sidejobs.clone(),
            intake: intake.clone(),
            bus: bus.clone(),
        });
        spawn_input_worker(cfg.strategy, inputs_rx, ctx, runtime_token.clone());
        spawn_dispatcher(
            events_rx,
            intake.clone(),
            bus.clone(),
            runtime_token.clone(),
            event_handler,
        );

        // Subscribe before anything can publish so the fan-out misses
        // nothing, the first status change included.
        let fanout_rx = bus.subscribe();
        let set = InterceptorSet::start(
            interceptors,
            InterceptorScope::new(intake.clone()),
            bus.clone(),
        );
        let fanout = set.into_listener(fanout_rx, runtime_token.clone());

        Self {
            cfg,
            bus,
            intake,
            state,
            sidejobs,
            status_tx,
            runtime_token,
            lifecycle: Mutex::new(Some(fanout)),
        }
    }

    // === Lifecycle ===

    /// Transitions `NotStarted` to `Running`. Fails on a container that
    /// already left `NotStarted`.
    pub async fn start(&self) -> Result<(), ContainerError> {
        let _guard = self.lifecycle.lock().await;
        let current = *self.status_tx.borrow();
        if current != Status::NotStarted {
            return Err(ContainerError::AlreadyStarted {
                status: current.as_label(),
            });
        }
        self.set_status(Status::Running);
        Ok(())
    }

    /// Runs the five-phase graceful shutdown and ends in `Cleared`.
    ///
    /// Everything admitted before its gate closed is still processed.
    /// Side jobs stuck past the grace period are reported via
    /// [`ContainerError::GraceExceeded`]; the container still reaches
    /// `Cleared`.
    pub async fn request_shutdown(&self) -> Result<(), ContainerError> {
        let mut guard = self.lifecycle.lock().await;
        let current = *self.status_tx.borrow();
        if !current.is_running() {
            return Err(ContainerError::NotRunning {
                status: current.as_label(),
            });
        }

        // Phase 1: no new inputs; drain what got in.
        self.set_status(Status::ShuttingDown {
            state_change_open: true,
            main_queue_open: false,
            events_open: true,
            side_jobs_open: true,
            side_job_cancellation_open: true,
        });
        let _ = self.intake.drain_inputs().await;

        // Phase 2: no new events; drain the dispatcher.
        self.set_status(Status::ShuttingDown {
            state_change_open: true,
            main_queue_open: false,
            events_open: false,
            side_jobs_open: true,
            side_job_cancellation_open: true,
        });
        let _ = self.intake.drain_events().await;

        // Phase 3: no new side jobs.
        self.set_status(Status::ShuttingDown {
            state_change_open: true,
            main_queue_open: false,
            events_open: false,
            side_jobs_open: false,
            side_job_cancellation_open: true,
        });

        // Phase 4: no manual cancellation; stop every side job.
        self.set_status(Status::ShuttingDown {
            state_change_open: true,
            main_queue_open: false,
            events_open: false,
            side_jobs_open: false,
            side_job_cancellation_open: false,
        });
        let grace_result = self.sidejobs.cancel_all(self.cfg.grace).await;

        // Phase 5: freeze state and tear down.
        self.set_status(Status::ShuttingDown {
            state_change_open: false,
            main_queue_open: false,
            events_open: false,
            side_jobs_open: false,
            side_job_cancellation_open: false,
        });
        self.finalize(&mut guard).await;

        grace_result
    }

    /// Hard teardown from any state except `Cleared`. Pending items
    /// resolve as cancelled; side jobs get the configured grace.
    pub async fn clear(&self) -> Result<(), ContainerError> {
        let mut guard = self.lifecycle.lock().await;
        let current = *self.status_tx.borrow();
        if current == Status::Cleared {
            return Err(ContainerError::AlreadyCleared);
        }
        let grace_result = self.sidejobs.cancel_all(self.cfg.grace).await;
        self.finalize(&mut guard).await;
        grace_result
    }

    /// Publishes `Cleared`, cancels the runtime, and reclaims the
    /// interceptor fan-out. The `Cleared` publish happens before the
    /// cancel so the listener's backlog drain delivers it.
    async fn finalize(&self, guard: &mut MutexGuard<'_, Option<FanoutHandle<M>>>) {
        self.set_status(Status::Cleared);
        self.runtime_token.cancel();
        if let Some(fanout) = guard.take() {
            if let Ok(set) = fanout.await {
                set.shutdown().await;
            }
        }
    }

    fn set_status(&self, status: Status) {
        self.status_tx.send_replace(status);
        self.bus
            .publish(Notification::now(NotificationKind::StatusChanged { status }));
    }

    // === Inputs ===

    /// Enqueues an input, waiting for queue capacity. Returns the item's
    /// correlation id.
    pub async fn send(&self, input: M::Input) -> Result<u64, ContainerError> {
        self.intake.submit(QueuedItem::input(input)).await
    }

    /// Enqueues an input only if capacity is immediately available.
    pub fn try_send_now(&self, input: M::Input) -> Result<u64, ContainerError> {
        self.intake.try_submit(QueuedItem::input(input))
    }

    /// Enqueues an input and waits for its terminal outcome: `Ok` once the
    /// handler finished, or the cancellation/failure it ended with.
    pub async fn send_and_await(&self, input: M::Input) -> Result<(), ContainerError> {
        let (tx, rx) = oneshot::channel();
        self.intake
            .submit(QueuedItem::input_with_completion(input, tx))
            .await?;
        rx.await.map_err(|_| ContainerError::Cancelled)?
    }

    /// Enqueues a state restore and waits for it to commit. The restore
    /// rides the input queue, so it is ordered like any other item, but it
    /// bypasses the handler.
    pub async fn send_restore(&self, state: M::State) -> Result<(), ContainerError> {
        let (tx, rx) = oneshot::channel();
        self.intake
            .submit(QueuedItem::restore_with_completion(state, tx))
            .await?;
        rx.await.map_err(|_| ContainerError::Cancelled)?
    }

    // === Events ===

    /// Posts an event into the FIFO dispatcher. Returns the event's
    /// correlation id.
    pub async fn post_event(&self, event: M::Event) -> Result<u64, ContainerError> {
        self.intake.post_event(event, None).await
    }

    /// Attaches the external event handler; buffered events flush to it in
    /// post order before this returns. Fails if one is already attached.
    pub async fn attach_event_handler(
        &self,
        handler: Arc<dyn EventHandler<M>>,
    ) -> Result<(), ContainerError> {
        self.intake.attach_event_handler(handler).await
    }

    /// Detaches the event handler. Returns whether one was attached.
    pub async fn detach_event_handler(&self) -> Result<bool, ContainerError> {
        self.intake.detach_event_handler().await
    }

    // === Side jobs ===

    /// Cancels the side job under `key` from outside a handler. Returns
    /// whether a job was running.
    pub async fn cancel_side_job(&self, key: &str) -> Result<bool, ContainerError> {
        self.status().check_cancel_side_job()?;
        Ok(self.sidejobs.cancel(key).await)
    }

    /// Sorted keys of currently running side jobs.
    pub async fn side_job_keys(&self) -> Vec<String> {
        self.sidejobs.keys().await
    }

    // === Observation ===

    /// Reads the current state value.
    pub async fn state(&self) -> Result<M::State, ContainerError> {
        self.state.read().await
    }

    /// Watch subscription to committed state values, in commit order.
    pub fn observe_state(&self) -> watch::Receiver<M::State> {
        self.state.observe()
    }

    /// Snapshot of the lifecycle status.
    pub fn status(&self) -> Status {
        *self.status_tx.borrow()
    }

    /// Watch subscription to lifecycle status changes.
    pub fn observe_status(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    /// Raw subscription to the notification bus.
    pub fn notifications(&self) -> broadcast::Receiver<Notification<M>> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::ContainerBuilder;
    use crate::core::guard::{EventScope, InputScope};
    use crate::error::HandlerError;
    use async_trait::async_trait;
    use std::time::Duration;

    struct TestMachine;

    impl Machine for TestMachine {
        type Input = u32;
        type Event = u32;
        type State = Vec<u32>;
    }

    /// Pushes inputs; 150 is slow, 500 fails, 900 starts a long side job,
    /// 901 posts the input back as an event.
    struct PushHandler;

    #[async_trait]
    impl Handler<TestMachine> for PushHandler {
        async fn handle(
            &self,
            scope: &mut InputScope<TestMachine>,
            input: u32,
        ) -> Result<(), HandlerError> {
            match input {
                500 => Err(HandlerError::fail("bad input")),
                900 => {
                    scope
                        .start_side_job("long", |job| async move {
                            job.cancelled().await;
                            Err(HandlerError::Canceled)
                        })
                        .await?;
                    Ok(())
                }
                901 => {
                    scope.post_event(901).await?;
                    Ok(())
                }
                n => {
                    if n == 150 {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    scope
                        .mutate(move |mut v| {
                            v.push(n);
                            v
                        })
                        .await?;
                    Ok(())
                }
            }
        }
    }

    struct EchoEvents {
        seen: Arc<std::sync::Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl EventHandler<TestMachine> for EchoEvents {
        async fn on_event(
            &self,
            _scope: &EventScope<TestMachine>,
            event: u32,
        ) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn container() -> Container<TestMachine> {
        ContainerBuilder::new()
            .build(Vec::new(), Arc::new(PushHandler))
    }

    #[tokio::test]
    async fn test_send_rejected_until_started() {
        let c = container();
        let res = c.send(1).await;
        assert_eq!(
            res,
            Err(ContainerError::Rejected {
                operation: "accept_input",
                status: "not_started",
            })
        );

        c.start().await.unwrap();
        c.send_and_await(1).await.unwrap();
        assert_eq!(c.state().await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let c = container();
        c.start().await.unwrap();
        assert_eq!(
            c.start().await,
            Err(ContainerError::AlreadyStarted { status: "running" })
        );
    }

    #[tokio::test]
    async fn test_send_and_await_reports_handler_failure() {
        let c = container();
        c.start().await.unwrap();
        assert_eq!(
            c.send_and_await(500).await,
            Err(ContainerError::HandlerFailed {
                error: "execution failed: bad input".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_shutdown_processes_admitted_inputs_then_clears() {
        let c = container();
        c.start().await.unwrap();

        // Admitted before the gate closes; the slow one is in flight when
        // shutdown begins.
        let state = c.observe_state();
        c.send(150).await.unwrap();
        c.send(1).await.unwrap();
        c.request_shutdown().await.unwrap();

        assert_eq!(c.status(), Status::Cleared);
        // Both admitted inputs committed before the queue closed.
        assert_eq!(*state.borrow(), vec![150, 1]);

        // Inputs after shutdown are dropped at the gate, the non-blocking
        // path included.
        assert_eq!(
            c.send(2).await,
            Err(ContainerError::Rejected {
                operation: "accept_input",
                status: "cleared",
            })
        );
        assert!(matches!(
            c.try_send_now(3),
            Err(ContainerError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_gates_in_fixed_order() {
        let c = container();
        c.start().await.unwrap();
        let mut notes = c.notifications();
        c.request_shutdown().await.unwrap();

        let mut phases = Vec::new();
        while let Ok(note) = notes.try_recv() {
            if let NotificationKind::StatusChanged { status } = note.kind {
                phases.push(status);
            }
        }

        assert_eq!(phases.len(), 6);
        let expect_open = [
            // (main_queue, events, side_jobs, cancellation, state_change)
            (false, true, true, true, true),
            (false, false, true, true, true),
            (false, false, false, true, true),
            (false, false, false, false, true),
            (false, false, false, false, false),
        ];
        for (phase, want) in phases.iter().take(5).zip(expect_open) {
            match phase {
                Status::ShuttingDown {
                    state_change_open,
                    main_queue_open,
                    events_open,
                    side_jobs_open,
                    side_job_cancellation_open,
                } => {
                    assert_eq!(
                        (
                            *main_queue_open,
                            *events_open,
                            *side_jobs_open,
                            *side_job_cancellation_open,
                            *state_change_open,
                        ),
                        want
                    );
                }
                other => panic!("expected shutting_down, got {}", other.as_label()),
            }
        }
        assert_eq!(phases[5], Status::Cleared);
    }

    #[tokio::test]
    async fn test_shutdown_requires_running() {
        let c = container();
        assert_eq!(
            c.request_shutdown().await,
            Err(ContainerError::NotRunning {
                status: "not_started",
            })
        );
    }

    #[tokio::test]
    async fn test_clear_is_terminal_and_fails_when_repeated() {
        let c = container();
        c.start().await.unwrap();
        c.clear().await.unwrap();
        assert_eq!(c.status(), Status::Cleared);
        assert_eq!(c.clear().await, Err(ContainerError::AlreadyCleared));
        assert_eq!(
            c.request_shutdown().await,
            Err(ContainerError::NotRunning { status: "cleared" })
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_side_jobs() {
        let c = container();
        c.start().await.unwrap();
        let mut notes = c.notifications();

        c.send_and_await(900).await.unwrap();
        assert_eq!(c.side_job_keys().await, vec!["long"]);

        c.request_shutdown().await.unwrap();
        let mut cancelled = false;
        while let Ok(note) = notes.try_recv() {
            if note.kind.label() == "side_job_cancelled" {
                assert_eq!(note.key.as_deref(), Some("long"));
                cancelled = true;
            }
        }
        assert!(cancelled);
    }

    #[tokio::test]
    async fn test_event_handler_from_builder_receives_posted_events() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let c = ContainerBuilder::new()
            .with_event_handler(Arc::new(EchoEvents { seen: seen.clone() }))
            .build(Vec::new(), Arc::new(PushHandler));
        c.start().await.unwrap();

        // One posted directly, one posted by the input handler.
        c.post_event(3).await.unwrap();
        c.send_and_await(901).await.unwrap();
        c.request_shutdown().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![3, 901]);
    }

    #[tokio::test]
    async fn test_restore_rides_the_input_queue() {
        let c = container();
        c.start().await.unwrap();

        c.send_and_await(1).await.unwrap();
        c.send_restore(vec![7, 8]).await.unwrap();
        c.send_and_await(2).await.unwrap();

        assert_eq!(c.state().await.unwrap(), vec![7, 8, 2]);
    }

    #[tokio::test]
    async fn test_observers_track_state_and_status() {
        let c = container();
        let mut status = c.observe_status();
        let mut state = c.observe_state();
        c.start().await.unwrap();

        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), Status::Running);

        c.send_and_await(4).await.unwrap();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), vec![4]);
    }

    #[tokio::test]
    async fn test_final_status_reaches_interceptors() {
        use crate::interceptors::Intercept;
        use crate::interceptors::InterceptorScope;

        struct StatusSpy {
            last: Arc<std::sync::Mutex<Option<&'static str>>>,
        }

        #[async_trait]
        impl Intercept<TestMachine> for StatusSpy {
            fn name(&self) -> &str {
                "status_spy"
            }

            async fn on_notification(
                &self,
                _scope: &InterceptorScope<TestMachine>,
                note: Notification<TestMachine>,
            ) {
                if let NotificationKind::StatusChanged { status } = note.kind {
                    *self.last.lock().unwrap() = Some(status.as_label());
                }
            }
        }

        let last = Arc::new(std::sync::Mutex::new(None));
        let c = ContainerBuilder::new()
            .with_interceptor(Arc::new(StatusSpy { last: last.clone() }))
            .build(Vec::new(), Arc::new(PushHandler));
        c.start().await.unwrap();
        c.request_shutdown().await.unwrap();

        // request_shutdown joined the fan-out, so delivery is complete.
        assert_eq!(*last.lock().unwrap(), Some("cleared"));
    }
}
