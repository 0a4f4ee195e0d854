//! # Interceptor fan-out: one worker and one bounded queue per interceptor.
//!
//! The set receives every bus notification once and forwards a clone to
//! each interceptor's private queue. Workers drain their queues
//! independently, so a slow or panicking interceptor is isolated: it can
//! only lose its own notifications, never block a sibling or the runtime.
//!
//! ## Architecture
//! ```text
//! Bus ──► listener task ──► InterceptorSet::emit
//!                                │ try_send (never blocks)
//!              ┌─────────────────┼─────────────────┐
//!              ▼                 ▼                 ▼
//!          mpsc (cap A)     mpsc (cap B)      mpsc (cap C)
//!              │                 │                 │
//!          worker A          worker B          worker C
//!        (catch_unwind)    (catch_unwind)    (catch_unwind)
//! ```
//!
//! ## Rules
//! - `emit` never blocks; a full queue drops the notification for that
//!   interceptor only.
//! - A panic in `on_notification` is reported as `InterceptorFailed` and
//!   the worker keeps consuming.
//! - After the runtime token cancels, the listener drains the broadcast
//!   backlog so terminal notifications (the final status change included)
//!   still reach the interceptors.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::intercept::Intercept;
use super::scope::InterceptorScope;
use crate::error::panic_text;
use crate::machine::Machine;
use crate::notifications::{Bus, Notification, NotificationKind};

struct Worker<M: Machine> {
    tx: mpsc::Sender<Notification<M>>,
    join: JoinHandle<()>,
}

/// Owns the interceptor workers for one container.
pub(crate) struct InterceptorSet<M: Machine> {
    workers: Vec<Worker<M>>,
}

impl<M: Machine> InterceptorSet<M> {
    /// Spawns one worker per interceptor and reports each attach.
    pub(crate) fn start(
        interceptors: Vec<Arc<dyn Intercept<M>>>,
        scope: InterceptorScope<M>,
        bus: Bus<M>,
    ) -> Self {
        let workers = interceptors
            .into_iter()
            .map(|interceptor| {
                let capacity = interceptor.queue_capacity().max(1);
                let (tx, rx) = mpsc::channel(capacity);
                let join = tokio::spawn(run_worker(interceptor, rx, scope.clone(), bus.clone()));
                Worker { tx, join }
            })
            .collect();
        Self { workers }
    }

    /// Forwards one notification to every worker. Never blocks; a full
    /// queue loses this notification for that interceptor only.
    pub(crate) fn emit(&self, note: &Notification<M>) {
        for worker in &self.workers {
            let _ = worker.tx.try_send(note.clone());
        }
    }

    /// Spawns the listener that pumps the bus into the set. The returned
    /// handle yields the set back for [`InterceptorSet::shutdown`].
    pub(crate) fn into_listener(
        self,
        mut rx: broadcast::Receiver<Notification<M>>,
        token: CancellationToken,
    ) -> JoinHandle<Self> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    res = rx.recv() => match res {
                        Ok(note) => self.emit(&note),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            // Deliver what was published just before cancellation.
            loop {
                match rx.try_recv() {
                    Ok(note) => self.emit(&note),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            self
        })
    }

    /// Closes every queue and waits for the workers to finish their
    /// backlogs.
    pub(crate) async fn shutdown(self) {
        for worker in self.workers {
            drop(worker.tx);
            let _ = worker.join.await;
        }
    }
}

async fn run_worker<M: Machine>(
    interceptor: Arc<dyn Intercept<M>>,
    mut rx: mpsc::Receiver<Notification<M>>,
    scope: InterceptorScope<M>,
    bus: Bus<M>,
) {
    let name: Arc<str> = Arc::from(interceptor.name());

    if let Err(panic) = std::panic::AssertUnwindSafe(interceptor.on_attach(&scope))
        .catch_unwind()
        .await
    {
        bus.publish(
            Notification::now(NotificationKind::InterceptorFailed)
                .with_key(name.clone())
                .with_detail(format!("on_attach panicked: {}", panic_text(&*panic))),
        );
    }
    bus.publish(Notification::now(NotificationKind::InterceptorAttached).with_key(name.clone()));

    while let Some(note) = rx.recv().await {
        let deliver = interceptor.on_notification(&scope, note);
        if let Err(panic) = std::panic::AssertUnwindSafe(deliver).catch_unwind().await {
            bus.publish(
                Notification::now(NotificationKind::InterceptorFailed)
                    .with_key(name.clone())
                    .with_detail(panic_text(&*panic)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::test_support::standalone_intake;
    use crate::core::status::Status;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct TestMachine;

    impl Machine for TestMachine {
        type Input = u32;
        type Event = u32;
        type State = u32;
    }

    /// Records labels; panics on `input_rejected`.
    struct Spy {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Intercept<TestMachine> for Spy {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_notification(
            &self,
            _scope: &InterceptorScope<TestMachine>,
            note: Notification<TestMachine>,
        ) {
            if note.kind.label() == "input_rejected" {
                panic!("spy cannot stomach rejections");
            }
            self.seen.lock().unwrap().push(note.kind.label());
        }
    }

    /// Records input-phase labels only, ignoring the set's own attach and
    /// failure notifications. Never panics.
    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Intercept<TestMachine> for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_notification(
            &self,
            _scope: &InterceptorScope<TestMachine>,
            note: Notification<TestMachine>,
        ) {
            if note.kind.label().starts_with("input") {
                self.seen.lock().unwrap().push(note.kind.label());
            }
        }
    }

    fn set_with(
        spies: Vec<Arc<dyn Intercept<TestMachine>>>,
        bus: &Bus<TestMachine>,
    ) -> InterceptorSet<TestMachine> {
        let scope = InterceptorScope::new(standalone_intake(bus.clone(), Status::Running));
        InterceptorSet::start(spies, scope, bus.clone())
    }

    #[tokio::test]
    async fn test_every_interceptor_receives_each_notification() {
        let bus: Bus<TestMachine> = Bus::new(64);
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        let set = set_with(
            vec![
                Arc::new(Spy { name: "a", seen: a.clone() }),
                Arc::new(Spy { name: "b", seen: b.clone() }),
            ],
            &bus,
        );

        set.emit(&Notification::now(NotificationKind::InputQueued));
        set.emit(&Notification::now(NotificationKind::InputHandled));
        set.shutdown().await;

        assert_eq!(*a.lock().unwrap(), vec!["input_queued", "input_handled"]);
        assert_eq!(*b.lock().unwrap(), vec!["input_queued", "input_handled"]);
    }

    #[tokio::test]
    async fn test_panicking_interceptor_is_isolated_and_reported() {
        let bus: Bus<TestMachine> = Bus::new(64);
        let mut notes = bus.subscribe();
        let healthy = Arc::new(Mutex::new(Vec::new()));
        let set = set_with(
            vec![
                Arc::new(Spy { name: "fragile", seen: Arc::new(Mutex::new(Vec::new())) }),
                Arc::new(Recorder { name: "healthy", seen: healthy.clone() }),
            ],
            &bus,
        );

        set.emit(&Notification::now(NotificationKind::InputRejected));
        set.emit(&Notification::now(NotificationKind::InputHandled));
        set.shutdown().await;

        // The sibling got both notifications despite the panic.
        assert_eq!(
            *healthy.lock().unwrap(),
            vec!["input_rejected", "input_handled"]
        );

        let mut failed = None;
        while let Ok(note) = notes.try_recv() {
            if note.kind.label() == "interceptor_failed" {
                failed = Some(note);
            }
        }
        let failed = failed.expect("no interceptor_failed published");
        assert_eq!(failed.key.as_deref(), Some("fragile"));
        assert!(failed
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("cannot stomach"));
    }

    #[tokio::test]
    async fn test_listener_drains_backlog_after_cancel() {
        let bus: Bus<TestMachine> = Bus::new(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = set_with(vec![Arc::new(Recorder { name: "s", seen: seen.clone() })], &bus);

        let token = CancellationToken::new();
        let listener = set.into_listener(bus.subscribe(), token.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Published before the cancel, possibly observed only after it.
        bus.publish(Notification::now(NotificationKind::InputHandled));
        token.cancel();

        let set = listener.await.unwrap();
        set.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec!["input_handled"]);
    }
}
