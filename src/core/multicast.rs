//! Explicit multicast primitive for stream payloads.
//!
//! A [`Multicast`] owns one upstream stream and fans every item out to any
//! number of observers. The upstream runs at most once: it starts on the
//! first [`Multicast::connect`] and is never restarted, so producer side
//! effects are not repeated per subscriber. Observers joining after the
//! stream ended only see its terminal notification.
//!
//! ```text
//! upstream ──► pump task ──┬──► observer 1
//!                          ├──► observer 2
//!                          └──► observer N
//! ```
//!
//! Each observer holds a [`MulticastSubscription`]; dropping it detaches that
//! observer alone. When the last observer leaves a running upstream, the
//! upstream is aborted and the multicast counts as completed.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::stream::{BoxStream, Stream, StreamExt};
use log::{debug, error, warn};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::{isolate, lock};
use super::message::Failure;
use super::observer::Observer;

/// Boxed fallible stream of payload items.
pub type ValueStream = BoxStream<'static, anyhow::Result<Value>>;

enum Upstream {
    Idle(ValueStream),
    Running(JoinHandle<()>),
    Completed,
    Failed(Failure),
}

impl Upstream {
    fn label(&self) -> &'static str {
        match self {
            Upstream::Idle(_) => "idle",
            Upstream::Running(_) => "running",
            Upstream::Completed => "completed",
            Upstream::Failed(_) => "failed",
        }
    }
}

struct State {
    observers: Vec<(u64, Arc<dyn Observer>)>,
    next_id: u64,
    upstream: Upstream,
}

struct Shared {
    state: Mutex<State>,
}

/// One upstream, many observers.
#[derive(Clone)]
pub struct Multicast {
    shared: Arc<Shared>,
}

impl Multicast {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    observers: Vec::new(),
                    next_id: 0,
                    upstream: Upstream::Idle(stream.boxed()),
                }),
            }),
        }
    }

    /// Attach an observer.
    ///
    /// If the upstream already terminated, the observer is notified
    /// immediately (completion, or the failure when it handles errors) and
    /// the returned subscription is inert.
    #[must_use = "dropping the subscription detaches the observer"]
    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> MulticastSubscription {
        let terminal = {
            let mut state = lock(&self.shared.state);
            let terminal = match &state.upstream {
                Upstream::Completed => Some(None),
                Upstream::Failed(failure) => Some(Some(failure.clone())),
                Upstream::Idle(_) | Upstream::Running(_) => None,
            };

            if terminal.is_none() {
                let id = state.next_id;
                state.next_id += 1;
                state.observers.push((id, observer.clone()));
                return MulticastSubscription {
                    shared: Arc::downgrade(&self.shared),
                    id: Some(id),
                };
            }
            terminal
        };

        match terminal {
            Some(Some(failure)) => notify_failure(vec![(0, observer)], &failure),
            _ => notify(&observer, |observer| observer.on_complete()),
        }
        MulticastSubscription::inert()
    }

    /// Start the upstream. Idempotent: only the first call has an effect.
    ///
    /// Outside a tokio runtime the upstream cannot be driven; the multicast
    /// then fails and current observers receive that failure.
    pub fn connect(&self) {
        let mut state = lock(&self.shared.state);
        let stream = match std::mem::replace(&mut state.upstream, Upstream::Completed) {
            Upstream::Idle(stream) => stream,
            other => {
                state.upstream = other;
                return;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(pump(self.shared.clone(), stream));
                state.upstream = Upstream::Running(handle);
            }
            Err(e) => {
                warn!("Cannot drive shared stream without an async runtime: {}", e);
                let failure: Failure = Arc::new(anyhow::anyhow!("no async runtime to drive the stream: {e}"));
                state.upstream = Upstream::Failed(failure.clone());
                let observers = std::mem::take(&mut state.observers);
                drop(state);
                notify_failure(observers, &failure);
            }
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.shared.state).observers.len()
    }

    /// Whether the upstream completed, failed or was cancelled.
    pub fn is_terminated(&self) -> bool {
        matches!(
            lock(&self.shared.state).upstream,
            Upstream::Completed | Upstream::Failed(_)
        )
    }
}

impl fmt::Debug for Multicast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Multicast")
            .field("upstream", &state.upstream.label())
            .field("observers", &state.observers.len())
            .finish()
    }
}

async fn pump(shared: Arc<Shared>, mut stream: ValueStream) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => {
                let observers: Vec<Arc<dyn Observer>> = lock(&shared.state)
                    .observers
                    .iter()
                    .map(|(_, observer)| observer.clone())
                    .collect();
                for observer in observers {
                    notify(&observer, |observer| observer.on_next(&value));
                }
            }
            Err(error) => {
                let failure: Failure = Arc::new(error);
                let observers = finish(&shared, Upstream::Failed(failure.clone()));
                notify_failure(observers, &failure);
                return;
            }
        }
    }

    for (_, observer) in finish(&shared, Upstream::Completed) {
        notify(&observer, |observer| observer.on_complete());
    }
}

fn finish(shared: &Shared, terminal: Upstream) -> Vec<(u64, Arc<dyn Observer>)> {
    let mut state = lock(&shared.state);
    state.upstream = terminal;
    std::mem::take(&mut state.observers)
}

fn notify_failure(observers: Vec<(u64, Arc<dyn Observer>)>, failure: &Failure) {
    for (_, observer) in observers {
        if observer.handles_errors() {
            notify(&observer, |observer| observer.on_error(failure));
        }
    }
}

/// A panicking observer is logged and the others are still notified.
fn notify(observer: &Arc<dyn Observer>, call: impl FnOnce(&dyn Observer)) {
    if let Err(panic) = isolate(|| call(observer.as_ref())) {
        error!("Shared stream observer panicked: {}", panic);
    }
}

/// Handle of one observer attached to a [`Multicast`].
pub struct MulticastSubscription {
    shared: Weak<Shared>,
    id: Option<u64>,
}

impl MulticastSubscription {
    fn inert() -> Self {
        Self {
            shared: Weak::new(),
            id: None,
        }
    }

    /// Detach the observer now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the observer attached until the upstream terminates.
    pub fn detach(mut self) {
        self.id = None;
    }

    pub fn is_active(&self) -> bool {
        let Some(id) = self.id else {
            return false;
        };
        self.shared
            .upgrade()
            .map(|shared| lock(&shared.state).observers.iter().any(|(oid, _)| *oid == id))
            .unwrap_or(false)
    }

    fn release(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let mut state = lock(&shared.state);
        state.observers.retain(|(oid, _)| *oid != id);
        if state.observers.is_empty() && matches!(state.upstream, Upstream::Running(_)) {
            if let Upstream::Running(handle) = std::mem::replace(&mut state.upstream, Upstream::Completed) {
                debug!("Last observer left, cancelling shared stream");
                handle.abort();
            }
        }
    }
}

impl Drop for MulticastSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MulticastSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastSubscription").field("id", &self.id).finish()
    }
}
