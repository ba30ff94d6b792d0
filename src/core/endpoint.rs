use std::fmt;
use std::sync::Arc;

use futures::stream::Stream;
use log::debug;
use serde_json::Value;

use super::bus::{ListenerHandle, Middleware};
use super::message::{Channel, Failure, RouteKey};
use super::multicast::Multicast;
use super::observer::Observer;

/// A controller's wired handle onto the bus.
///
/// Publishing and listening default to the controller's own name as topic
/// and to the in-process channel.
#[derive(Clone)]
pub struct Endpoint {
    name: String,
    middleware: Middleware,
}

impl Endpoint {
    pub(crate) fn new(name: impl Into<String>, middleware: Middleware) -> Self {
        Self {
            name: name.into(),
            middleware,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn middleware(&self) -> &Middleware {
        &self.middleware
    }

    /// Publish `value` on `(name, inproc)`.
    pub fn dispatch(&self, value: impl Into<Value>) {
        self.middleware.dispatch(self.name.as_str(), Channel::Inproc, value);
    }

    pub fn dispatch_to(&self, topic: impl Into<String>, channel: Channel, value: impl Into<Value>) {
        self.middleware.dispatch(topic, channel, value);
    }

    /// Publish a failure on `(name, inproc)`.
    pub fn dispatch_error(&self, error: impl Into<anyhow::Error>) {
        self.middleware.dispatch_error(self.name.as_str(), Channel::Inproc, error);
    }

    /// Publish a shared stream on `(name, multicast)`.
    pub fn dispatch_stream<S>(&self, stream: S) -> Multicast
    where
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        self.middleware.dispatch_stream(self.name.as_str(), Channel::Multicast, stream)
    }

    /// Listen on `(name, inproc)`.
    pub fn listen<O>(&self, observer: O) -> ListenerHandle
    where
        O: Observer + 'static,
    {
        self.listen_to(self.name.as_str(), Channel::Inproc, observer)
    }

    pub fn listen_to<O>(&self, topic: impl Into<String>, channel: Channel, observer: O) -> ListenerHandle
    where
        O: Observer + 'static,
    {
        let key = RouteKey::new(topic, channel);
        let traced = Traced {
            receiver: self.name.clone(),
            key: key.clone(),
            inner: Arc::new(observer),
        };
        self.middleware.subscribe(key.topic, key.channel, traced)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("name", &self.name).finish()
    }
}

/// Logs what a controller receives before handing it on.
struct Traced {
    receiver: String,
    key: RouteKey,
    inner: Arc<dyn Observer>,
}

impl Observer for Traced {
    fn on_next(&self, value: &Value) {
        debug!("Controller {} has received a message on {}: {}", self.receiver, self.key, value);
        self.inner.on_next(value);
    }

    fn on_error(&self, error: &Failure) {
        debug!("Controller {} has received a failure on {}: {:#}", self.receiver, self.key, error);
        self.inner.on_error(error);
    }

    fn on_complete(&self) {
        self.inner.on_complete();
    }

    fn handles_errors(&self) -> bool {
        self.inner.handles_errors()
    }
}
