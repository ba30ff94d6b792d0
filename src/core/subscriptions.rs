//! Bridge from external asynchronous producers into the bus.
//!
//! Every registered producer gets a pump task that forwards its items to
//! `(topic, channel)`. The registry keeps one entry per active id and cleans
//! it up on its own when the producer completes or fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{Stream, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::bus::Middleware;
use super::lock;
use super::message::Channel;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("observable '{0}' is already registered")]
    Duplicate(String),

    #[error("observable '{0}' cannot be registered outside of an async runtime")]
    NoRuntime(String),
}

#[derive(Debug)]
struct ActiveSubscription {
    serial: u64,
    topic: String,
    channel: Channel,
    handle: JoinHandle<()>,
    started_at: Instant,
}

type SubscriptionMap = HashMap<String, ActiveSubscription>;

/// Snapshot of one active producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub topic: String,
    pub channel: Channel,
    pub elapsed: Duration,
}

pub struct SubscriptionRegistry {
    subscriptions: Arc<Mutex<SubscriptionMap>>,
    next_serial: AtomicU64,
    middleware: Middleware,
}

impl SubscriptionRegistry {
    pub fn new(middleware: Middleware) -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_serial: AtomicU64::new(1),
            middleware,
        }
    }

    /// Start forwarding `stream` to `(topic, channel)` under `id`.
    ///
    /// Each item is dispatched as a value. A failed item is dispatched as an
    /// error and ends the subscription; so does the end of the stream. Both
    /// remove the entry.
    ///
    /// # Errors
    /// [`RegistryError::Duplicate`] if `id` is still active,
    /// [`RegistryError::NoRuntime`] when called outside a tokio runtime.
    pub fn register<S>(
        &self,
        id: impl Into<String>,
        stream: S,
        topic: impl Into<String>,
        channel: Channel,
    ) -> Result<(), RegistryError>
    where
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        let id = id.into();
        let topic = topic.into();

        // Held until the entry is inserted so a fast producer cannot finish
        // and clean up before it exists.
        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RegistryError::NoRuntime(id.clone()))?;
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let handle = runtime.spawn(pump(
            id.clone(),
            serial,
            stream,
            topic.clone(),
            channel.clone(),
            self.middleware.clone(),
            self.subscriptions.clone(),
        ));

        info!("Registered observable '{}' -> {}@{}", id, topic, channel);
        subscriptions.insert(
            id,
            ActiveSubscription {
                serial,
                topic,
                channel,
                handle,
                started_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Stop the producer behind `id` and forget it.
    ///
    /// Unknown or already finished ids are ignored; returns whether anything
    /// was stopped.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = lock(&self.subscriptions).remove(id);
        match removed {
            Some(subscription) => {
                subscription.handle.abort();
                info!("Unregistered observable '{}'", id);
                true
            }
            None => {
                debug!("Attempt to unregister non-registered observable {}", id);
                false
            }
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        lock(&self.subscriptions).contains_key(id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn info(&self, id: &str) -> Option<SubscriptionInfo> {
        lock(&self.subscriptions).get(id).map(|subscription| SubscriptionInfo {
            id: id.to_string(),
            topic: subscription.topic.clone(),
            channel: subscription.channel.clone(),
            elapsed: subscription.started_at.elapsed(),
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.subscriptions).is_empty()
    }

    /// Abort every producer.
    pub fn cancel_all(&self) {
        let drained: Vec<ActiveSubscription> = lock(&self.subscriptions).drain().map(|(_, active)| active).collect();
        for subscription in drained {
            subscription.handle.abort();
        }
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Removes the registry entry when the pump ends, including when it unwinds
/// or is aborted.
struct Cleanup {
    id: String,
    serial: u64,
    subscriptions: Arc<Mutex<SubscriptionMap>>,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        let mut subscriptions = lock(&self.subscriptions);
        // A newer registration may have reused the id after this one was unregistered.
        if subscriptions.get(&self.id).is_some_and(|active| active.serial == self.serial) {
            subscriptions.remove(&self.id);
            debug!("Observable '{}' finished and was unregistered", self.id);
        }
    }
}

async fn pump<S>(
    id: String,
    serial: u64,
    stream: S,
    topic: String,
    channel: Channel,
    middleware: Middleware,
    subscriptions: Arc<Mutex<SubscriptionMap>>,
) where
    S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
{
    let _cleanup = Cleanup {
        id: id.clone(),
        serial,
        subscriptions,
    };

    let mut stream = std::pin::pin!(stream);
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => middleware.dispatch(topic.as_str(), channel.clone(), value),
            Err(e) => {
                warn!("Observable '{}' failed: {:#}", id, e);
                middleware.dispatch_error(topic.as_str(), channel.clone(), e);
                break;
            }
        }
    }
}
