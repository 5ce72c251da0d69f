//! Filter/dispatch engine
//!
//! Every event is offered to every registration in registration order.
//! Synchronous signals run inline; deferred ones are handed to a
//! [`DeferredDispatcher`]. Handler errors and panics are caught per signal and
//! routed to [`Signal::failed`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use smol_str::SmolStr;
use tokio::sync::{Notify, Semaphore};

use crate::error::{ConfigError, DispatchError};
use crate::event::{Event, EventKind};
use crate::signal::{QueueMode, Registration, Signal};

/// Run a signal's handler, reporting any failure to its failure hook
///
/// Returns whether the handler succeeded.
pub fn run_signal(signal: &dyn Signal, event: &Event) -> bool {
    let error = match catch_unwind(AssertUnwindSafe(|| signal.handle(event))) {
        Ok(Ok(())) => return true,
        Ok(Err(source)) => DispatchError::Handler {
            signal: signal.name().to_string(),
            source,
        },
        Err(payload) => DispatchError::from_panic(signal.name(), payload),
    };

    tracing::warn!(
        signal = signal.name(),
        did = %event.author_id,
        kind = %event.kind(),
        collection = event.collection(),
        %error,
        "signal handler failed"
    );
    if catch_unwind(AssertUnwindSafe(|| signal.failed(event, &error))).is_err() {
        tracing::error!(signal = signal.name(), "failure hook panicked");
    }
    false
}

/// Out-of-band execution of deferred signals
pub trait DeferredDispatcher: Send + Sync + 'static {
    /// Queue name, for logs
    fn queue(&self) -> &str;

    /// Schedule `signal` to handle `event`
    ///
    /// Implementations report handler failures through [`Signal::failed`].
    fn dispatch(&self, signal: Arc<dyn Signal>, event: Arc<Event>);
}

/// In-process deferred dispatcher on tokio's blocking pool
///
/// At most `max_concurrency` handlers run at once; the rest wait for a permit.
/// Handlers run in no particular order relative to each other.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    queue: SmolStr,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TaskDispatcher {
    /// Create a dispatcher for `queue` running up to `max_concurrency` handlers
    pub fn new(queue: impl Into<SmolStr>, max_concurrency: usize) -> Self {
        Self {
            queue: queue.into(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Handlers scheduled but not yet finished
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every scheduled handler has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl DeferredDispatcher for TaskDispatcher {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn dispatch(&self, signal: Arc<dyn Signal>, event: Arc<Event>) {
        self.pending.fetch_add(1, Ordering::SeqCst);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                queue = %self.queue,
                signal = signal.name(),
                "no tokio runtime for deferred dispatch, running inline"
            );
            run_signal(signal.as_ref(), &event);
            self.finish();
            return;
        };

        let this = self.clone();
        runtime.spawn(async move {
            match this.permits.clone().acquire_owned().await {
                Ok(permit) => {
                    let result = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        run_signal(signal.as_ref(), &event);
                    })
                    .await;
                    if let Err(error) = result {
                        tracing::error!(queue = %this.queue, %error, "deferred task failed");
                    }
                }
                Err(_) => {
                    tracing::error!(queue = %this.queue, "deferred dispatcher closed");
                }
            }
            this.finish();
        });
    }
}

/// Outcome of offering one event to every registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Registrations whose filters matched
    pub matched: usize,
    /// Synchronous handlers that failed
    pub failed: usize,
    /// Handlers handed to the deferred dispatcher
    pub deferred: usize,
}

/// Routes events to matching registrations
#[derive(Default)]
pub struct Dispatcher {
    registrations: Vec<Registration>,
    deferred: Option<Arc<dyn DeferredDispatcher>>,
}

impl Dispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signal
    pub fn register(&mut self, signal: impl Signal) -> Result<&mut Self, ConfigError> {
        self.registrations.push(Registration::new(signal)?);
        Ok(self)
    }

    /// Register a prepared registration
    pub fn push(&mut self, registration: Registration) -> &mut Self {
        self.registrations.push(registration);
        self
    }

    /// Attach a deferred dispatcher
    pub fn with_deferred(mut self, deferred: impl DeferredDispatcher) -> Self {
        self.deferred = Some(Arc::new(deferred));
        self
    }

    /// Whether a deferred dispatcher is attached
    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    /// All registrations, in registration order
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Reject deferred signals that have nowhere to run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deferred.is_some() {
            return Ok(());
        }
        match self
            .registrations
            .iter()
            .find(|r| r.queue_mode() == QueueMode::Deferred)
        {
            Some(r) => Err(ConfigError::DeferredWithoutDispatcher {
                signal: r.name().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Collection patterns to request server-side
    ///
    /// `None` when any commit registration wants every collection, since a
    /// partial list would hide its events.
    pub fn wanted_collections(&self) -> Option<Vec<SmolStr>> {
        let commits: Vec<_> = self
            .registrations
            .iter()
            .filter(|r| r.event_kinds().contains(&EventKind::Commit))
            .collect();
        if commits.is_empty() || commits.iter().any(|r| r.wants_all_collections()) {
            return None;
        }
        let mut wanted: Vec<SmolStr> = Vec::new();
        for pattern in commits.iter().filter_map(|r| r.collections()).flat_map(|f| f.patterns()) {
            if !wanted.contains(pattern) {
                wanted.push(pattern.clone());
            }
        }
        Some(wanted)
    }

    /// Author DIDs to request server-side, under the same all-or-nothing rule
    pub fn wanted_dids(&self) -> Option<Vec<SmolStr>> {
        if self.registrations.is_empty() {
            return None;
        }
        let mut wanted: Vec<SmolStr> = Vec::new();
        for registration in &self.registrations {
            let authors = registration.authors()?;
            let mut authors: Vec<_> = authors.iter().cloned().collect();
            authors.sort();
            for author in authors {
                if !wanted.contains(&author) {
                    wanted.push(author);
                }
            }
        }
        Some(wanted)
    }

    /// Offer `event` to every registration
    pub fn dispatch(&self, event: &Arc<Event>) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        for registration in &self.registrations {
            if !registration.matches(event) {
                continue;
            }
            summary.matched += 1;

            match (registration.queue_mode(), &self.deferred) {
                (QueueMode::Deferred, Some(deferred)) => {
                    tracing::trace!(
                        signal = registration.name(),
                        queue = deferred.queue(),
                        "deferring signal"
                    );
                    deferred.dispatch(registration.signal().clone(), event.clone());
                    summary.deferred += 1;
                }
                (mode, _) => {
                    if mode == QueueMode::Deferred {
                        tracing::warn!(
                            signal = registration.name(),
                            "no deferred dispatcher, running inline"
                        );
                    }
                    if !run_signal(registration.signal().as_ref(), event) {
                        summary.failed += 1;
                    }
                }
            }
        }
        summary
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registrations", &self.registrations)
            .field("deferred", &self.deferred.as_ref().map(|d| d.queue().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::event::{Commit, EventPayload, Operation};
    use crate::signal::FnSignal;
    use std::sync::Mutex;

    fn post(did: &str) -> Arc<Event> {
        Arc::new(Event {
            author_id: did.into(),
            time_us: 10,
            payload: EventPayload::Commit(Commit {
                revision: "rev".into(),
                operation: Operation::Create,
                collection: "app.bsky.feed.post".into(),
                record_key: "abc".into(),
                record: None,
                cid: None,
            }),
        })
    }

    struct Recording {
        handled: Arc<Mutex<Vec<String>>>,
        failures: Arc<Mutex<Vec<String>>>,
        fail: bool,
        panic: bool,
    }

    impl Signal for Recording {
        fn event_kinds(&self) -> Vec<EventKind> {
            vec![EventKind::Commit]
        }

        fn handle(&self, event: &Event) -> Result<(), BoxError> {
            if self.panic {
                panic!("handler exploded");
            }
            if self.fail {
                return Err("handler refused".into());
            }
            self.handled.lock().unwrap().push(event.author_id.to_string());
            Ok(())
        }

        fn failed(&self, _event: &Event, error: &DispatchError) {
            self.failures.lock().unwrap().push(error.to_string());
        }
    }

    fn recording(fail: bool, panic: bool) -> (Recording, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(Vec::new()));
        (
            Recording {
                handled: handled.clone(),
                failures: failures.clone(),
                fail,
                panic,
            },
            handled,
            failures,
        )
    }

    #[test]
    fn failures_do_not_stop_other_signals() {
        let (failing, _, failing_errors) = recording(true, false);
        let (panicking, _, panic_errors) = recording(false, true);
        let (healthy, handled, _) = recording(false, false);

        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(failing)
            .unwrap()
            .register(panicking)
            .unwrap()
            .register(healthy)
            .unwrap();

        let summary = dispatcher.dispatch(&post("did:plc:alice"));
        assert_eq!(summary.matched, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.deferred, 0);
        assert_eq!(*handled.lock().unwrap(), vec!["did:plc:alice".to_string()]);
        assert!(failing_errors.lock().unwrap()[0].contains("handler refused"));
        assert!(panic_errors.lock().unwrap()[0].contains("handler exploded"));
    }

    #[test]
    fn deferred_without_dispatcher_fails_validation() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(FnSignal::new("later", [EventKind::Commit], |_| Ok(())).deferred())
            .unwrap();
        assert!(matches!(
            dispatcher.validate(),
            Err(ConfigError::DeferredWithoutDispatcher { signal }) if signal == "later"
        ));

        let dispatcher = dispatcher.with_deferred(TaskDispatcher::new("default", 2));
        assert!(dispatcher.validate().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deferred_signals_run_on_task_dispatcher() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let tasks = TaskDispatcher::new("default", 2);

        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(
                FnSignal::new("later", [EventKind::Commit], move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .deferred(),
            )
            .unwrap();
        let dispatcher = dispatcher.with_deferred(tasks.clone());

        for _ in 0..5 {
            let summary = dispatcher.dispatch(&post("did:plc:alice"));
            assert_eq!(summary.deferred, 1);
        }
        tasks.wait_idle().await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(tasks.pending(), 0);
    }

    #[test]
    fn wanted_collections_all_or_nothing() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(
                FnSignal::new("feed", [EventKind::Commit], |_| Ok(()))
                    .collections(["app.bsky.feed.*", "app.bsky.graph.follow"]),
            )
            .unwrap()
            .register(
                FnSignal::new("follows", [EventKind::Commit], |_| Ok(()))
                    .collections(["app.bsky.graph.follow"]),
            )
            .unwrap()
            .register(FnSignal::new("ids", [EventKind::Identity], |_| Ok(())))
            .unwrap();
        assert_eq!(
            dispatcher.wanted_collections(),
            Some(vec![
                SmolStr::new("app.bsky.feed.*"),
                SmolStr::new("app.bsky.graph.follow")
            ])
        );

        dispatcher
            .register(FnSignal::new("everything", [EventKind::Commit], |_| Ok(())))
            .unwrap();
        assert_eq!(dispatcher.wanted_collections(), None);
    }

    #[test]
    fn wanted_dids_all_or_nothing() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(FnSignal::new("a", EventKind::ALL, |_| Ok(())).authors(["did:plc:b", "did:plc:a"]))
            .unwrap();
        assert_eq!(
            dispatcher.wanted_dids(),
            Some(vec![SmolStr::new("did:plc:a"), SmolStr::new("did:plc:b")])
        );

        dispatcher
            .register(FnSignal::new("anyone", [EventKind::Account], |_| Ok(())))
            .unwrap();
        assert_eq!(dispatcher.wanted_dids(), None);
    }
}
