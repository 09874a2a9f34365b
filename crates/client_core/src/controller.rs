//! Per-screen state machine binding events to operations.
//!
//! Every dispatch gets a sequence number; only the most recent dispatch may
//! clear the loading flag or publish an error, so a late completion of an
//! older event cannot mask work that is still in flight. Dispatches sharing
//! an event kind supersede each other: the older one is aborted and its
//! [`EventToken`] stops accepting state reductions.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use futures::{stream::BoxStream, FutureExt};
use shared::{AppError, Outcome};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    context::{panic_message, BackgroundContext},
    operation::Operation,
    stream_operation::StreamOperation,
};

pub trait ScreenEvent: Send + 'static {
    /// Dispatches with the same kind supersede one another.
    fn kind(&self) -> &'static str;
}

#[async_trait]
pub trait Screen: Send + Sync + 'static {
    type State: Clone + Send + Sync + 'static;
    type Event: ScreenEvent;

    fn initial_state(&self) -> Self::State;

    async fn handle_event(
        &self,
        event: Self::Event,
        scope: EventScope<Self::State>,
    ) -> anyhow::Result<()>;
}

/// Validity of one dispatched event.
#[derive(Debug, Clone)]
pub struct EventToken {
    kind: &'static str,
    generation: u64,
    latest: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl EventToken {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.latest.load(Ordering::SeqCst) == self.generation
    }
}

/// Handed to [`Screen::handle_event`]; the only way an event touches state.
pub struct EventScope<S> {
    seq: u64,
    token: EventToken,
    state: Arc<watch::Sender<S>>,
    background: BackgroundContext,
}

impl<S> EventScope<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn token(&self) -> &EventToken {
        &self.token
    }

    pub fn is_active(&self) -> bool {
        self.token.is_active()
    }

    pub fn state(&self) -> S {
        self.state.borrow().clone()
    }

    /// Replaces the state with `f(current)`. Returns `false`, leaving the
    /// state untouched, once this event has been superseded or the
    /// controller has closed.
    pub fn reduce(&self, f: impl FnOnce(&S) -> S) -> bool {
        let token = &self.token;
        let applied = self.state.send_if_modified(|current| {
            if !token.is_active() {
                return false;
            }
            *current = f(current);
            true
        });
        if !applied {
            debug!(event = token.kind, seq = self.seq, "discarding reduction from stale event");
        }
        applied
    }

    pub async fn invoke<O: Operation>(&self, operation: Arc<O>, params: O::Params) -> Outcome<O::Output> {
        self.background.invoke(operation, params).await
    }

    pub fn invoke_stream<O: StreamOperation>(
        &self,
        operation: Arc<O>,
        params: O::Params,
    ) -> BoxStream<'static, Outcome<O::Output>> {
        self.background.invoke_stream(operation, params)
    }
}

struct InFlight {
    kind: &'static str,
    task: JoinHandle<()>,
}

/// Bookkeeping that every dispatch, completion and close updates together.
#[derive(Default)]
struct Dispatches {
    latest_seq: u64,
    generations: HashMap<&'static str, Arc<AtomicU64>>,
    in_flight: HashMap<u64, InFlight>,
}

struct Shared<S> {
    state: Arc<watch::Sender<S>>,
    loading: watch::Sender<bool>,
    error: watch::Sender<Option<AppError>>,
    closed: Arc<AtomicBool>,
    dispatches: Mutex<Dispatches>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S> Shared<S> {
    /// Assigns the next sequence number and a fresh generation for `kind`,
    /// aborting older dispatches of that kind. Callers hold the lock until
    /// the new task is recorded.
    fn begin(&self, dispatches: &mut Dispatches, kind: &'static str) -> (u64, EventToken) {
        dispatches.latest_seq += 1;
        let seq = dispatches.latest_seq;

        let latest = Arc::clone(dispatches.generations.entry(kind).or_default());
        let generation = latest.fetch_add(1, Ordering::SeqCst) + 1;
        let token = EventToken {
            kind,
            generation,
            latest,
            closed: Arc::clone(&self.closed),
        };

        dispatches.in_flight.retain(|superseded_seq, entry| {
            if entry.kind != kind || *superseded_seq >= seq {
                return true;
            }
            debug!(event = kind, seq = *superseded_seq, "aborting superseded dispatch");
            entry.task.abort();
            false
        });

        self.loading.send_replace(true);
        self.error.send_replace(None);
        (seq, token)
    }

    fn complete(&self, seq: u64, kind: &'static str, failure: Option<AppError>) {
        let mut dispatches = lock(&self.dispatches);
        dispatches.in_flight.remove(&seq);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let latest = dispatches.latest_seq;
        if latest != seq {
            match failure {
                Some(err) => warn!(
                    event = kind,
                    seq,
                    latest,
                    code = ?err.code(),
                    error = %err,
                    "discarding failure of superseded dispatch"
                ),
                None => debug!(event = kind, seq, latest, "ignoring completion of superseded dispatch"),
            }
            return;
        }
        if let Some(err) = failure {
            warn!(event = kind, seq, code = ?err.code(), error = %err, "event handling failed");
            self.error.send_replace(Some(err));
        }
        self.loading.send_replace(false);
    }
}

pub struct Controller<Sc: Screen> {
    screen: Arc<Sc>,
    background: BackgroundContext,
    shared: Arc<Shared<Sc::State>>,
}

impl<Sc: Screen> Controller<Sc> {
    pub fn new(screen: Sc, background: BackgroundContext) -> Self {
        let (state, _) = watch::channel(screen.initial_state());
        let (loading, _) = watch::channel(false);
        let (error, _) = watch::channel(None);
        Self {
            screen: Arc::new(screen),
            background,
            shared: Arc::new(Shared {
                state: Arc::new(state),
                loading,
                error,
                closed: Arc::new(AtomicBool::new(false)),
                dispatches: Mutex::new(Dispatches::default()),
            }),
        }
    }

    pub fn screen(&self) -> &Sc {
        &self.screen
    }

    /// Fire-and-continue entry point. Returns the dispatch sequence number,
    /// or `None` once the controller is closed.
    ///
    /// Safe to call from several threads at once: sequence numbers,
    /// generations and supersession are decided under one lock.
    pub fn dispatch(&self, event: Sc::Event) -> Option<u64> {
        let shared = &self.shared;
        let kind = event.kind();

        let mut dispatches = lock(&shared.dispatches);
        if shared.closed.load(Ordering::SeqCst) {
            debug!("dispatch on closed controller ignored");
            return None;
        }
        let (seq, token) = shared.begin(&mut dispatches, kind);
        debug!(event = kind, seq, "dispatching event");

        let scope = EventScope {
            seq,
            token,
            state: Arc::clone(&shared.state),
            background: self.background.clone(),
        };
        let screen = Arc::clone(&self.screen);
        let completion = Arc::clone(shared);
        let task = self.background.handle().spawn(async move {
            let result = AssertUnwindSafe(screen.handle_event(event, scope))
                .catch_unwind()
                .await;
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(AppError::from(err)),
                Err(payload) => Some(AppError::unknown(format!(
                    "handler for `{kind}` panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            completion.complete(seq, kind, failure);
        });
        dispatches.in_flight.insert(seq, InFlight { kind, task });
        Some(seq)
    }

    pub fn state(&self) -> watch::Receiver<Sc::State> {
        self.shared.state.subscribe()
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.shared.loading.subscribe()
    }

    pub fn errors(&self) -> watch::Receiver<Option<AppError>> {
        self.shared.error.subscribe()
    }

    pub fn current_state(&self) -> Sc::State {
        self.shared.state.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        *self.shared.loading.borrow()
    }

    pub fn error(&self) -> Option<AppError> {
        self.shared.error.borrow().clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.shared
            .error
            .borrow()
            .as_ref()
            .map(|err| err.message().to_string())
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.shared.dispatches).in_flight.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the most recent dispatch has completed.
    pub async fn wait_idle(&self) {
        let mut loading = self.loading();
        let _ = loading.wait_for(|busy| !*busy).await;
    }

    /// Tears the controller down, aborting every outstanding event task and
    /// everything those tasks are awaiting.
    pub fn close(&self) {
        let aborted: Vec<InFlight> = {
            let mut dispatches = lock(&self.shared.dispatches);
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            dispatches.in_flight.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &aborted {
            entry.task.abort();
        }
        self.shared.loading.send_replace(false);
        info!(aborted = aborted.len(), "controller closed");
    }
}

impl<Sc: Screen> Drop for Controller<Sc> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
