use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::multicast::Multicast;
use crate::constants::{CHANNEL_EXTERNAL, CHANNEL_INPROC, CHANNEL_MULTICAST};

/// Shared failure carried by error envelopes and failed streams.
pub type Failure = Arc<anyhow::Error>;

/// Logical transport of a message.
///
/// The well-known channels are conventions layered on the routing key;
/// `Named` lets an application add its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Channel {
    /// Data originating outside the application (device feeds, timers, network)
    External,
    /// Controller-to-controller traffic
    #[default]
    Inproc,
    /// Explicitly shared one-to-many streams
    Multicast,
    Named(String),
}

impl Channel {
    pub fn as_str(&self) -> &str {
        match self {
            Channel::External => CHANNEL_EXTERNAL,
            Channel::Inproc => CHANNEL_INPROC,
            Channel::Multicast => CHANNEL_MULTICAST,
            Channel::Named(name) => name,
        }
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        match name {
            CHANNEL_EXTERNAL => Channel::External,
            CHANNEL_INPROC => Channel::Inproc,
            CHANNEL_MULTICAST => Channel::Multicast,
            other => Channel::Named(other.to_string()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing key of the bus: a listener only ever sees envelopes whose topic
/// and channel both match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub topic: String,
    pub channel: Channel,
}

impl RouteKey {
    pub fn new(topic: impl Into<String>, channel: Channel) -> Self {
        Self {
            topic: topic.into(),
            channel,
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.topic, self.channel)
    }
}

/// What an envelope carries.
#[derive(Clone)]
pub enum Payload {
    /// A single item followed by completion
    Value(Value),
    /// A sequence that fails immediately
    Failure(Failure),
    /// A shared asynchronous sequence
    Stream(Multicast),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Value(_) => "value",
            Payload::Failure(_) => "failure",
            Payload::Stream(_) => "stream",
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Payload::Failure(error) => f.debug_tuple("Failure").field(&format!("{error:#}")).finish(),
            Payload::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

/// The `(topic, channel, payload)` unit routed by the bus.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub channel: Channel,
    pub payload: Payload,
}

impl Message {
    pub fn new(topic: impl Into<String>, channel: Channel, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            channel,
            payload,
        }
    }

    pub fn route_key(&self) -> RouteKey {
        RouteKey::new(self.topic.clone(), self.channel.clone())
    }
}
