//! Core routing, context and lifecycle functionality.
//!
//! This module contains the building blocks every controller relies on:
//! the message bus, the shared context, the bridge for external producers
//! and the controller abstraction itself.
//!
//! # Module Components
//!
//! - [`message`] - Envelopes, channels and routing keys
//! - [`observer`] - Observer trait and closure-based listeners
//! - [`multicast`] - One upstream, many observers
//! - [`bus`] - The [`Middleware`]: routing and controller registry
//! - [`endpoint`] - A controller's wired handle onto the bus
//! - [`controller`] - The [`Controller`] trait and lifecycle phases
//! - [`context`] - Deferred, late-bound shared values
//! - [`subscriptions`] - External producers feeding the bus
//! - [`engine`] - Rendering seam
//!
//! # Architecture
//!
//! 1. **Controllers** implement [`Controller`] and hold an [`Endpoint`]
//! 2. **Messages** are routed by exact `(topic, channel)` match
//! 3. **Context** provides shared values that may arrive later
//! 4. **External producers** are pumped onto the bus by the [`SubscriptionRegistry`]
//! 5. **Layouts** are handed to an [`Engine`] during the render phase

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bus;
pub mod context;
pub mod controller;
pub mod endpoint;
pub mod engine;
pub mod message;
pub mod multicast;
pub mod observer;
pub mod subscriptions;

// Re-export core types for easier access from other modules
pub use bus::{ListenerHandle, Middleware, Registration};
pub use context::{ContextCell, ContextError, ContextProvider, ContextStore, ContextValue};
pub use controller::{Controller, Phase};
pub use endpoint::Endpoint;
pub use engine::{ApplicationUi, Engine, Layout, LogEngine};
pub use message::{Channel, Failure, Message, Payload, RouteKey};
pub use multicast::{Multicast, MulticastSubscription, ValueStream};
pub use observer::{Listener, Observer};
pub use subscriptions::{RegistryError, SubscriptionInfo, SubscriptionRegistry};

/// Locks are never held while user code runs, so a poisoned lock still
/// guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

thread_local! {
    static ISOLATING: Cell<usize> = const { Cell::new(0) };
}

/// Run user code, turning a panic into an `Err` carrying its message.
///
/// Panics raised while this runs are already handled by the caller, so the
/// error handler installed by the application ignores them.
pub(crate) fn isolate<T>(action: impl FnOnce() -> T) -> Result<T, String> {
    ISOLATING.with(|depth| depth.set(depth.get() + 1));
    let outcome = panic::catch_unwind(AssertUnwindSafe(action));
    ISOLATING.with(|depth| depth.set(depth.get().saturating_sub(1)));
    outcome.map_err(|payload| panic_message(payload.as_ref()))
}

/// Whether the current thread is inside [`isolate`].
pub(crate) fn is_isolating() -> bool {
    ISOLATING.with(|depth| depth.get() > 0)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
