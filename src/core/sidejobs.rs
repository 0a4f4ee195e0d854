//! # Side-job supervisor: keyed, cancellable, restartable background work.
//!
//! The supervisor owns a map from string key to a supervised task handle.
//! Re-submitting a key cancels the prior job cooperatively and replaces the
//! entry; each job runs in its own child execution context so that failure
//! or cancellation never propagates to sibling jobs or to the command whose
//! handler launched it.
//!
//! ## Architecture
//! ```text
//! InputScope::start_side_job(key, body)
//!         │
//!         ▼
//! SideJobSupervisor ── RwLock<HashMap<key, JobHandle>> ──► spawned job
//!         │                 (join + cancel token)            │
//!         │                                                  ▼
//!         └─► prior entry? cancel → join → replace       Bus: Queued,
//!                                                        Started{reason},
//!                                                        Completed/
//!                                                        Cancelled/Error
//! ```
//!
//! ## Rules
//! - Each job publishes exactly one terminal notification.
//! - Cancellation is cooperative: it takes effect at the body's own
//!   suspension points; code past the cancellation point never runs.
//! - A panicking body is caught and reported as a side-job error for that
//!   key only.
//! - All entries are torn down unconditionally on container teardown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::queue::{Intake, QueuedItem};
use crate::error::{panic_text, ContainerError, HandlerError};
use crate::interceptors::Intercept;
use crate::machine::Machine;
use crate::notifications::{Bus, Notification, NotificationKind, RestartReason};

/// Registered interceptors, addressable by name from side-job bodies.
pub(crate) type ObserverRegistry<M> = Arc<HashMap<String, Arc<dyn Intercept<M>>>>;

/// Boxed future produced by a side-job body.
pub(crate) type SideJobFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HandlerError>> + Send>>;

/// Boxed side-job body, invoked once with its scope.
pub(crate) type SideJobBody<M> = Box<dyn FnOnce(SideJobScope<M>) -> SideJobFuture + Send>;

/// Handle to a running side job.
struct JobHandle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
    /// Distinguishes this entry from a replacement under the same key.
    epoch: u64,
}

struct Inner<M: Machine> {
    jobs: RwLock<HashMap<String, JobHandle>>,
    /// Keys whose job already finished at least once; used to classify a
    /// re-submission as `Retried` rather than `Initial`.
    finished: RwLock<HashSet<String>>,
    epoch: AtomicU64,
    bus: Bus<M>,
    parent: CancellationToken,
    intake: Intake<M>,
    observers: ObserverRegistry<M>,
}

/// Supervisor for keyed background jobs. Cheap to clone.
pub(crate) struct SideJobSupervisor<M: Machine> {
    inner: Arc<Inner<M>>,
}

impl<M: Machine> Clone for SideJobSupervisor<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Machine> SideJobSupervisor<M> {
    pub(crate) fn new(
        bus: Bus<M>,
        parent: CancellationToken,
        intake: Intake<M>,
        observers: ObserverRegistry<M>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(HashMap::new()),
                finished: RwLock::new(HashSet::new()),
                epoch: AtomicU64::new(0),
                bus,
                parent,
                intake,
                observers,
            }),
        }
    }

    /// Starts (or restarts) a job under `key`.
    ///
    /// A live job under the same key is cancelled and joined first, so its
    /// terminal notification precedes the new job's notifications.
    pub(crate) async fn start(&self, key: String, body: SideJobBody<M>) {
        let prior = self.inner.jobs.write().await.remove(&key);
        let restart = match prior {
            Some(handle) => {
                handle.cancel.cancel();
                let _ = handle.join.await;
                RestartReason::Restarted
            }
            None => {
                if self.inner.finished.read().await.contains(&key) {
                    RestartReason::Retried
                } else {
                    RestartReason::Initial
                }
            }
        };

        self.inner.bus.publish(
            Notification::now(NotificationKind::SideJobQueued).with_key(key.as_str()),
        );

        let epoch = self.inner.epoch.fetch_add(1, AtomicOrdering::Relaxed);
        let token = self.inner.parent.child_token();
        let scope = SideJobScope {
            key: Arc::from(key.as_str()),
            restart,
            intake: self.inner.intake.clone(),
            observers: Arc::clone(&self.inner.observers),
            token: token.clone(),
        };

        // Hold the map lock across spawn + insert so the job's own cleanup
        // cannot observe the map before its entry exists.
        let mut jobs = self.inner.jobs.write().await;
        let inner = Arc::clone(&self.inner);
        let job_key = key.clone();
        let job_token = token.clone();
        let join = tokio::spawn(async move {
            run_job(inner, job_key, epoch, restart, body, scope, job_token).await;
        });
        jobs.insert(
            key,
            JobHandle {
                join,
                cancel: token,
                epoch,
            },
        );
    }

    /// Cancels and removes the job under `key`. Returns false (no-op) when
    /// no such job is running.
    pub(crate) async fn cancel(&self, key: &str) -> bool {
        let prior = self.inner.jobs.write().await.remove(key);
        match prior {
            Some(handle) => {
                handle.cancel.cancel();
                let _ = handle.join.await;
                true
            }
            None => false,
        }
    }

    /// Sorted keys of currently running jobs.
    pub(crate) async fn keys(&self) -> Vec<String> {
        let jobs = self.inner.jobs.read().await;
        let mut keys: Vec<String> = jobs.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Cancels every job and waits up to `grace` for all of them to stop.
    ///
    /// Jobs that do not stop in time are reported stuck; their keys are
    /// listed in the returned error.
    pub(crate) async fn cancel_all(&self, grace: Duration) -> Result<(), ContainerError> {
        let handles: Vec<(String, JobHandle)> =
            { self.inner.jobs.write().await.drain().collect() };

        for (_, handle) in &handles {
            handle.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut stuck = Vec::new();
        for (key, handle) in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle.join).await.is_err() {
                stuck.push(key);
            }
        }

        if stuck.is_empty() {
            Ok(())
        } else {
            stuck.sort_unstable();
            Err(ContainerError::GraceExceeded { grace, stuck })
        }
    }
}

/// Runs one job, cleans up its map entry, and publishes its terminal
/// notification.
async fn run_job<M: Machine>(
    inner: Arc<Inner<M>>,
    key: String,
    epoch: u64,
    restart: RestartReason,
    body: SideJobBody<M>,
    scope: SideJobScope<M>,
    token: CancellationToken,
) {
    inner.bus.publish(
        Notification::now(NotificationKind::SideJobStarted { restart }).with_key(key.as_str()),
    );

    let fut = std::panic::AssertUnwindSafe(body(scope)).catch_unwind();
    tokio::pin!(fut);
    let outcome = tokio::select! {
        biased;
        res = &mut fut => Some(res),
        _ = token.cancelled() => None,
    };

    let note = match outcome {
        None | Some(Ok(Err(HandlerError::Canceled))) => {
            Notification::now(NotificationKind::SideJobCancelled)
        }
        Some(Ok(Ok(()))) => Notification::now(NotificationKind::SideJobCompleted),
        Some(Ok(Err(err))) => {
            Notification::now(NotificationKind::SideJobError).with_detail(err.to_string())
        }
        Some(Err(panic)) => Notification::now(NotificationKind::SideJobError)
            .with_detail(format!("side job panicked: {}", panic_text(&*panic))),
    };
    // Clean up before publishing the terminal, so anyone who observed the
    // terminal sees the map entry gone and the key marked finished.
    {
        let mut jobs = inner.jobs.write().await;
        if jobs.get(&key).map(|h| h.epoch) == Some(epoch) {
            jobs.remove(&key);
        }
    }
    inner.finished.write().await.insert(key.clone());
    inner.bus.publish(note.with_key(key.as_str()));
}

/// # Scope handed to a side-job body.
///
/// Re-enters the container through the same gated paths as the public API,
/// but carries no state-mutation rights. Registered interceptors are
/// reachable by name through [`SideJobScope::observer`]. The body should
/// watch [`SideJobScope::cancelled`] and exit promptly on restart or
/// teardown.
pub struct SideJobScope<M: Machine> {
    key: Arc<str>,
    restart: RestartReason,
    intake: Intake<M>,
    observers: ObserverRegistry<M>,
    token: CancellationToken,
}

impl<M: Machine> SideJobScope<M> {
    /// The key this job runs under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Why this job (re)started.
    pub fn restart_reason(&self) -> RestartReason {
        self.restart
    }

    /// True once cancellation was requested for this job.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when cancellation is requested for this job.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Feeds an input back into the container, subject to lifecycle gates.
    pub async fn post_input(&self, input: M::Input) -> Result<(), ContainerError> {
        self.intake.submit(QueuedItem::input(input)).await.map(|_| ())
    }

    /// Posts an event, subject to lifecycle gates.
    pub async fn post_event(&self, event: M::Event) -> Result<(), ContainerError> {
        self.intake.post_event(event, None).await.map(|_| ())
    }

    /// Looks up a registered interceptor by its name.
    pub fn observer(&self, name: &str) -> Option<Arc<dyn Intercept<M>>> {
        self.observers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::Status;
    use crate::core::queue::test_support::standalone_intake;
    use tokio::sync::broadcast::Receiver;

    struct TestMachine;

    impl Machine for TestMachine {
        type Input = u32;
        type Event = u32;
        type State = u32;
    }

    fn fixture() -> (
        SideJobSupervisor<TestMachine>,
        Receiver<Notification<TestMachine>>,
        CancellationToken,
    ) {
        let bus: Bus<TestMachine> = Bus::new(128);
        let rx = bus.subscribe();
        let token = CancellationToken::new();
        let intake = standalone_intake(bus.clone(), Status::Running);
        let sup = SideJobSupervisor::new(bus, token.clone(), intake, Arc::new(HashMap::new()));
        (sup, rx, token)
    }

    async fn next_side_job_note(
        rx: &mut Receiver<Notification<TestMachine>>,
    ) -> Notification<TestMachine> {
        loop {
            let note = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for side-job notification")
                .expect("bus closed");
            if matches!(
                note.kind,
                NotificationKind::SideJobQueued
                    | NotificationKind::SideJobStarted { .. }
                    | NotificationKind::SideJobCompleted
                    | NotificationKind::SideJobCancelled
                    | NotificationKind::SideJobError
            ) {
                return note;
            }
        }
    }

    #[tokio::test]
    async fn test_initial_job_runs_to_completion() {
        let (sup, mut rx, _token) = fixture();

        sup.start("k".into(), Box::new(|_scope| Box::pin(async { Ok(()) })))
            .await;

        let queued = next_side_job_note(&mut rx).await;
        assert!(matches!(queued.kind, NotificationKind::SideJobQueued));
        assert_eq!(queued.key.as_deref(), Some("k"));

        let started = next_side_job_note(&mut rx).await;
        match started.kind {
            NotificationKind::SideJobStarted { restart } => {
                assert_eq!(restart, RestartReason::Initial)
            }
            other => panic!("expected side_job_started, got {}", other.label()),
        }

        let done = next_side_job_note(&mut rx).await;
        assert!(matches!(done.kind, NotificationKind::SideJobCompleted));
        assert!(sup.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_same_key_cancels_prior_exactly_once() {
        let (sup, mut rx, _token) = fixture();

        // Body A suspends forever; its post-cancellation code must never run.
        sup.start(
            "k".into(),
            Box::new(|scope| {
                Box::pin(async move {
                    scope.cancelled().await;
                    Err(HandlerError::Canceled)
                })
            }),
        )
        .await;
        // Consume A's queued/started.
        next_side_job_note(&mut rx).await;
        next_side_job_note(&mut rx).await;

        sup.start("k".into(), Box::new(|_scope| Box::pin(async { Ok(()) })))
            .await;

        // A's single terminal comes first, then B's full lifecycle.
        let cancelled = next_side_job_note(&mut rx).await;
        assert!(matches!(cancelled.kind, NotificationKind::SideJobCancelled));

        let queued = next_side_job_note(&mut rx).await;
        assert!(matches!(queued.kind, NotificationKind::SideJobQueued));
        let started = next_side_job_note(&mut rx).await;
        match started.kind {
            NotificationKind::SideJobStarted { restart } => {
                assert_eq!(restart, RestartReason::Restarted)
            }
            other => panic!("expected side_job_started, got {}", other.label()),
        }
        let done = next_side_job_note(&mut rx).await;
        assert!(matches!(done.kind, NotificationKind::SideJobCompleted));
    }

    #[tokio::test]
    async fn test_resubmit_after_completion_is_retried() {
        let (sup, mut rx, _token) = fixture();

        sup.start("k".into(), Box::new(|_scope| Box::pin(async { Ok(()) })))
            .await;
        // Drain first run: queued, started, completed.
        for _ in 0..3 {
            next_side_job_note(&mut rx).await;
        }

        sup.start("k".into(), Box::new(|_scope| Box::pin(async { Ok(()) })))
            .await;
        next_side_job_note(&mut rx).await; // queued
        let started = next_side_job_note(&mut rx).await;
        match started.kind {
            NotificationKind::SideJobStarted { restart } => {
                assert_eq!(restart, RestartReason::Retried)
            }
            other => panic!("expected side_job_started, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_key() {
        let (sup, mut rx, _token) = fixture();

        sup.start(
            "bad".into(),
            Box::new(|_scope| Box::pin(async { Err(HandlerError::fail("boom")) })),
        )
        .await;
        sup.start(
            "good".into(),
            Box::new(|_scope| Box::pin(async { Ok(()) })),
        )
        .await;

        let mut errors = 0;
        let mut completions = 0;
        for _ in 0..6 {
            let note = next_side_job_note(&mut rx).await;
            match note.kind {
                NotificationKind::SideJobError => {
                    assert_eq!(note.key.as_deref(), Some("bad"));
                    assert_eq!(note.detail.as_deref(), Some("execution failed: boom"));
                    errors += 1;
                }
                NotificationKind::SideJobCompleted => {
                    assert_eq!(note.key.as_deref(), Some("good"));
                    completions += 1;
                }
                _ => {}
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_panic_reported_as_error() {
        let (sup, mut rx, _token) = fixture();

        sup.start(
            "p".into(),
            Box::new(|_scope| Box::pin(async { panic!("kaboom") })),
        )
        .await;

        loop {
            let note = next_side_job_note(&mut rx).await;
            if let NotificationKind::SideJobError = note.kind {
                let detail = note.detail.as_deref().unwrap_or_default();
                assert!(detail.contains("kaboom"), "detail: {detail}");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_scope_resolves_observers_by_name() {
        use crate::interceptors::InterceptorScope;
        use async_trait::async_trait;

        struct Audit;

        #[async_trait]
        impl Intercept<TestMachine> for Audit {
            fn name(&self) -> &str {
                "audit"
            }

            async fn on_notification(
                &self,
                _scope: &InterceptorScope<TestMachine>,
                _note: Notification<TestMachine>,
            ) {
            }
        }

        let bus: Bus<TestMachine> = Bus::new(128);
        let mut rx = bus.subscribe();
        let token = CancellationToken::new();
        let intake = standalone_intake(bus.clone(), Status::Running);
        let registry: ObserverRegistry<TestMachine> = Arc::new(HashMap::from([(
            "audit".to_string(),
            Arc::new(Audit) as Arc<dyn Intercept<TestMachine>>,
        )]));
        let sup = SideJobSupervisor::new(bus, token.clone(), intake, registry);

        // The job succeeds only if the lookup resolves exactly the
        // registered name.
        sup.start(
            "k".into(),
            Box::new(|scope| {
                Box::pin(async move {
                    let found = scope.observer("audit");
                    if found.as_ref().map(|o| o.name()) != Some("audit") {
                        return Err(HandlerError::fail("registered observer not found"));
                    }
                    if scope.observer("missing").is_some() {
                        return Err(HandlerError::fail("unknown name resolved"));
                    }
                    Ok(())
                })
            }),
        )
        .await;

        loop {
            let note = next_side_job_note(&mut rx).await;
            match note.kind {
                NotificationKind::SideJobCompleted => break,
                NotificationKind::SideJobError => {
                    panic!("lookup failed: {:?}", note.detail)
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_is_noop_for_unknown_key() {
        let (sup, _rx, _token) = fixture();
        assert!(!sup.cancel("missing").await);
    }

    #[tokio::test]
    async fn test_cancel_all_joins_every_job() {
        let (sup, _rx, _token) = fixture();

        for key in ["a", "b", "c"] {
            sup.start(
                key.to_string(),
                Box::new(|scope| {
                    Box::pin(async move {
                        scope.cancelled().await;
                        Err(HandlerError::Canceled)
                    })
                }),
            )
            .await;
        }
        assert_eq!(sup.keys().await, vec!["a", "b", "c"]);

        sup.cancel_all(Duration::from_secs(1)).await.unwrap();
        assert!(sup.keys().await.is_empty());
    }
}
