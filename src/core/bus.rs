//! Message bus and controller registry.
//!
//! [`Middleware`] routes envelopes to listeners registered on the exact same
//! `(topic, channel)` pair and owns the registry of named controllers.
//!
//! ## Rules
//! - **Exact routing**: a listener never sees an envelope for another topic
//!   or another channel.
//! - **Synchronous publish**: `publish()` returns after every listener
//!   registered before the call has been invoked (or, for stream payloads,
//!   subscribed), in registration order.
//! - **Switching listeners**: each listener follows the latest envelope on
//!   its key; a new envelope cancels its subscription to a previous stream.
//! - **Reentrancy**: no lock is held while listener code runs, so listeners
//!   may publish or subscribe from inside a callback.
//! - **Isolation**: a listener that panics is logged and skipped; the
//!   listeners after it still receive the envelope.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::stream::Stream;
use log::{debug, error, info, trace};
use serde_json::Value;
use uuid::Uuid;

use super::controller::{Controller, Phase};
use super::endpoint::Endpoint;
use super::{isolate, lock};
use super::message::{Channel, Failure, Message, Payload, RouteKey};
use super::multicast::{Multicast, MulticastSubscription};
use super::observer::Observer;

struct ControllerEntry {
    name: String,
    controller: Arc<dyn Controller>,
    phase: Phase,
}

struct ListenerEntry {
    id: Uuid,
    observer: Arc<dyn Observer>,
    active: AtomicBool,
    current: Mutex<Option<MulticastSubscription>>,
}

impl ListenerEntry {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Replace the stream this listener follows; the previous one is
    /// released after the lock is dropped.
    fn switch(&self, next: Option<MulticastSubscription>) {
        let previous = std::mem::replace(&mut *lock(&self.current), next);
        drop(previous);
    }

    fn deliver(&self, key: &RouteKey, payload: &Payload) {
        match payload {
            Payload::Value(value) => {
                self.switch(None);
                self.observer.on_next(value);
                self.observer.on_complete();
            }
            Payload::Failure(failure) => {
                self.switch(None);
                if self.observer.handles_errors() {
                    self.observer.on_error(failure);
                } else {
                    debug!("Listener {} on {} has no error handler, skipping failure", self.id, key);
                }
            }
            Payload::Stream(stream) => {
                let subscription = stream.subscribe(self.observer.clone());
                self.switch(Some(subscription));
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    controllers: Mutex<Vec<ControllerEntry>>,
    listeners: Mutex<HashMap<RouteKey, Vec<Arc<ListenerEntry>>>>,
    trace_messages: AtomicBool,
}

/// Outcome of [`Middleware::register_controller`].
pub enum Registration {
    Added(Arc<dyn Controller>),
    /// A controller with that name was already registered; it is kept as is.
    AlreadyPresent(Arc<dyn Controller>),
}

impl Registration {
    pub fn controller(&self) -> &Arc<dyn Controller> {
        match self {
            Registration::Added(controller) | Registration::AlreadyPresent(controller) => controller,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, Registration::Added(_))
    }
}

/// The routing core. Cheap to clone; clones share the same registry.
#[derive(Clone, Default)]
pub struct Middleware {
    inner: Arc<Inner>,
}

impl Middleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether both handles share the same registry.
    pub fn ptr_eq(&self, other: &Middleware) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Release every controller and listener.
    ///
    /// Controllers and listener closures usually hold endpoints, which hold
    /// the middleware; clearing breaks those reference cycles at teardown.
    pub(crate) fn teardown(&self) {
        let controllers = std::mem::take(&mut *lock(&self.inner.controllers));
        let listeners = std::mem::take(&mut *lock(&self.inner.listeners));
        debug!(
            "Middleware teardown: released {} controller(s) and {} route(s)",
            controllers.len(),
            listeners.len()
        );
    }

    /// Log every routed envelope at `trace` level.
    pub fn set_trace_messages(&self, enabled: bool) {
        self.inner.trace_messages.store(enabled, Ordering::Relaxed);
    }

    /// Build the bus handle a controller named `name` publishes and listens through.
    pub fn endpoint(&self, name: impl Into<String>) -> Endpoint {
        Endpoint::new(name, self.clone())
    }

    /// Store a controller under its name.
    ///
    /// Registering a name twice is a no-op: the first controller stays and is
    /// returned as [`Registration::AlreadyPresent`].
    pub fn register_controller(&self, controller: Arc<dyn Controller>) -> Registration {
        let name = controller.name().to_string();
        let mut controllers = lock(&self.inner.controllers);
        if let Some(existing) = controllers.iter().find(|entry| entry.name == name) {
            debug!("Controller '{}' is already registered, keeping the existing one", name);
            return Registration::AlreadyPresent(existing.controller.clone());
        }

        info!("Registering controller '{}'", name);
        controllers.push(ControllerEntry {
            name,
            controller: controller.clone(),
            phase: Phase::Registered,
        });
        Registration::Added(controller)
    }

    pub fn controller(&self, name: &str) -> Option<Arc<dyn Controller>> {
        lock(&self.inner.controllers)
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.controller.clone())
    }

    /// All controllers in registration order.
    pub fn controllers(&self) -> Vec<Arc<dyn Controller>> {
        lock(&self.inner.controllers)
            .iter()
            .map(|entry| entry.controller.clone())
            .collect()
    }

    pub fn controller_count(&self) -> usize {
        lock(&self.inner.controllers).len()
    }

    pub fn phase(&self, name: &str) -> Option<Phase> {
        lock(&self.inner.controllers)
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.phase)
    }

    /// Move a controller forward to `phase`. Returns `false` when it is
    /// unknown or already at or past that phase, so each hook runs once.
    pub(crate) fn advance(&self, name: &str, phase: Phase) -> bool {
        let mut controllers = lock(&self.inner.controllers);
        match controllers.iter_mut().find(|entry| entry.name == name) {
            Some(entry) if entry.phase < phase => {
                entry.phase = phase;
                true
            }
            _ => false,
        }
    }

    /// Register interest in envelopes on exactly `(topic, channel)`.
    pub fn subscribe<O>(&self, topic: impl Into<String>, channel: Channel, observer: O) -> ListenerHandle
    where
        O: Observer + 'static,
    {
        self.subscribe_shared(topic, channel, Arc::new(observer))
    }

    pub fn subscribe_shared(
        &self,
        topic: impl Into<String>,
        channel: Channel,
        observer: Arc<dyn Observer>,
    ) -> ListenerHandle {
        let key = RouteKey::new(topic, channel);
        let id = Uuid::new_v4();
        let entry = Arc::new(ListenerEntry {
            id,
            observer,
            active: AtomicBool::new(true),
            current: Mutex::new(None),
        });

        trace!("Listener {} subscribed to {}", id, key);
        lock(&self.inner.listeners).entry(key.clone()).or_default().push(entry);

        ListenerHandle {
            inner: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    pub fn listener_count(&self, topic: &str, channel: &Channel) -> usize {
        lock(&self.inner.listeners)
            .get(&RouteKey::new(topic, channel.clone()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Route an envelope to every listener currently registered on its key.
    pub fn publish(&self, message: Message) {
        let key = message.route_key();
        let targets = lock(&self.inner.listeners).get(&key).cloned().unwrap_or_default();

        if self.inner.trace_messages.load(Ordering::Relaxed) {
            trace!(
                "Routing {} envelope on {} to {} listener(s)",
                message.payload.kind(),
                key,
                targets.len()
            );
        }

        for target in targets.iter().filter(|target| target.is_active()) {
            if let Err(panic) = isolate(|| target.deliver(&key, &message.payload)) {
                error!("Listener {} on {} panicked: {}", target.id, key, panic);
            }
        }

        if let Payload::Stream(stream) = &message.payload {
            stream.connect();
        }
    }

    /// Publish a single value followed by completion.
    pub fn dispatch(&self, topic: impl Into<String>, channel: Channel, value: impl Into<Value>) {
        self.publish(Message::new(topic, channel, Payload::Value(value.into())));
    }

    /// Publish a pre-failed sequence; only listeners with an error handler see it.
    pub fn dispatch_error(&self, topic: impl Into<String>, channel: Channel, error: impl Into<anyhow::Error>) {
        let failure: Failure = Arc::new(error.into());
        self.publish(Message::new(topic, channel, Payload::Failure(failure)));
    }

    /// Publish a stream shared between all matching listeners.
    ///
    /// Every listener is subscribed before the upstream starts, and the
    /// upstream runs once no matter how many listeners there are. The
    /// returned [`Multicast`] lets late observers join the running stream.
    pub fn dispatch_stream<S>(&self, topic: impl Into<String>, channel: Channel, stream: S) -> Multicast
    where
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        let shared = Multicast::new(stream);
        self.publish(Message::new(topic, channel, Payload::Stream(shared.clone())));
        shared
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("controllers", &self.controller_count())
            .field("routes", &lock(&self.inner.listeners).len())
            .finish()
    }
}

/// Registration of one listener on the bus.
///
/// Dropping the handle keeps the listener registered; call
/// [`ListenerHandle::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct ListenerHandle {
    inner: Weak<Inner>,
    key: RouteKey,
    id: Uuid,
}

impl ListenerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    /// Remove the listener and cancel the stream it currently follows.
    /// Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };

        let removed = {
            let mut listeners = lock(&inner.listeners);
            let Some(entries) = listeners.get_mut(&self.key) else {
                return false;
            };
            let removed = entries
                .iter()
                .position(|entry| entry.id == self.id)
                .map(|index| entries.remove(index));
            if entries.is_empty() {
                listeners.remove(&self.key);
            }
            removed
        };

        match removed {
            Some(entry) => {
                entry.active.store(false, Ordering::Release);
                entry.switch(None);
                trace!("Listener {} unsubscribed from {}", self.id, self.key);
                true
            }
            None => false,
        }
    }
}
