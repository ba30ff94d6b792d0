//! Late-bound shared context.
//!
//! [`ContextStore`] maps ids to deferred cells. A cell can be read before
//! anything was written to it; the first write to the id resolves the cell
//! every pending reader already holds. There is never more than one cell per
//! id: writing to an existing id updates that cell instead of replacing it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::lock;

/// Value stored in the context.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
enum Slot {
    Pending,
    Resolved(ContextValue),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context '{id}' was invalidated: {reason}")]
    Invalidated { id: String, reason: String },

    #[error("context '{0}' was abandoned before it was resolved")]
    Abandoned(String),

    #[error("context '{id}' does not hold a value of type {expected}")]
    TypeMismatch { id: String, expected: &'static str },
}

/// Asynchronous source of a context value, e.g. a session handshake or a
/// handle obtained from the embedding environment.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn provide(&self) -> anyhow::Result<ContextValue>;
}

/// Keyed store of deferred values. Clones share the same entries.
#[derive(Clone, Default)]
pub struct ContextStore {
    cells: Arc<Mutex<HashMap<String, watch::Sender<Slot>>>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `id` with `value`, satisfying any pending read.
    ///
    /// Writing again later replaces the value seen by subsequent reads.
    pub fn register_context<T>(&self, id: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.register_shared(id, Arc::new(value));
    }

    pub fn register_shared(&self, id: impl Into<String>, value: ContextValue) {
        let id = id.into();
        let mut cells = lock(&self.cells);
        match cells.get(&id) {
            Some(sender) => {
                let was_pending = matches!(*sender.borrow(), Slot::Pending);
                sender.send_replace(Slot::Resolved(value));
                if was_pending {
                    debug!("Context '{}' resolved for pending readers", id);
                } else {
                    debug!("Context '{}' overwritten", id);
                }
            }
            None => {
                let (sender, _) = watch::channel(Slot::Resolved(value));
                cells.insert(id, sender);
            }
        }
    }

    /// Cell for `id`, created pending if the id is unknown. Never blocks.
    pub fn get_context(&self, id: impl Into<String>) -> ContextCell {
        let id = id.into();
        let mut cells = lock(&self.cells);
        let sender = cells.entry(id.clone()).or_insert_with(|| watch::channel(Slot::Pending).0);
        ContextCell {
            id,
            receiver: sender.subscribe(),
        }
    }

    /// Reject a pending cell and forget the id. Returns whether the id existed.
    pub fn unregister_context(&self, id: &str) -> bool {
        self.invalidate(id, "context was unregistered")
    }

    /// Drop every entry. Pending readers observe [`ContextError::Abandoned`].
    pub fn clear_context(&self) {
        let dropped = std::mem::take(&mut *lock(&self.cells));
        debug!("Context cleared, {} entr(ies) dropped", dropped.len());
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.cells).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.cells).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.cells).is_empty()
    }

    /// Resolve `id` from an asynchronous provider.
    ///
    /// The id is pending until the provider finishes; a provider failure
    /// invalidates it. Without a tokio runtime the id is invalidated at once
    /// and `None` is returned.
    pub fn provide<P>(&self, id: impl Into<String>, provider: P) -> Option<JoinHandle<()>>
    where
        P: ContextProvider + 'static,
    {
        let id = id.into();
        drop(self.get_context(id.clone()));

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Cannot run provider for context '{}': {}", id, e);
                self.invalidate(&id, "no async runtime to run the provider");
                return None;
            }
        };

        let store = self.clone();
        Some(runtime.spawn(async move {
            match provider.provide().await {
                Ok(value) => store.register_shared(id, value),
                Err(e) => {
                    warn!("Provider for context '{}' failed: {:#}", id, e);
                    store.invalidate(&id, &format!("provider failed: {e:#}"));
                }
            }
        }))
    }

    fn invalidate(&self, id: &str, reason: &str) -> bool {
        let Some(sender) = lock(&self.cells).remove(id) else {
            debug!("Context '{}' is not registered, nothing to invalidate", id);
            return false;
        };

        if matches!(*sender.borrow(), Slot::Pending) {
            sender.send_replace(Slot::Rejected(reason.to_string()));
        }
        true
    }
}

impl fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells = lock(&self.cells);
        let mut ids: Vec<&String> = cells.keys().collect();
        ids.sort();
        f.debug_struct("ContextStore").field("ids", &ids).finish()
    }
}

/// Handle to a possibly still pending context value.
#[derive(Clone)]
pub struct ContextCell {
    id: String,
    receiver: watch::Receiver<Slot>,
}

impl ContextCell {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.receiver.borrow(), Slot::Resolved(_))
    }

    /// Peek without waiting; `None` while the value is still pending.
    pub fn try_get(&self) -> Option<Result<ContextValue, ContextError>> {
        let slot = self.receiver.borrow().clone();
        match slot {
            Slot::Pending if self.receiver.has_changed().is_err() => {
                Some(Err(ContextError::Abandoned(self.id.clone())))
            }
            Slot::Pending => None,
            settled => Some(self.settle(settled)),
        }
    }

    /// Wait for the value.
    pub async fn get(&self) -> Result<ContextValue, ContextError> {
        let mut receiver = self.receiver.clone();
        let slot = match receiver.wait_for(|slot| !matches!(slot, Slot::Pending)).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => return Err(ContextError::Abandoned(self.id.clone())),
        };
        self.settle(slot)
    }

    /// Wait for the value and downcast it to `T`.
    pub async fn get_as<T>(&self) -> Result<Arc<T>, ContextError>
    where
        T: Any + Send + Sync,
    {
        let value = self.get().await?;
        value.downcast::<T>().map_err(|_| ContextError::TypeMismatch {
            id: self.id.clone(),
            expected: std::any::type_name::<T>(),
        })
    }

    fn settle(&self, slot: Slot) -> Result<ContextValue, ContextError> {
        match slot {
            Slot::Resolved(value) => Ok(value),
            Slot::Rejected(reason) => Err(ContextError::Invalidated {
                id: self.id.clone(),
                reason,
            }),
            Slot::Pending => Err(ContextError::Abandoned(self.id.clone())),
        }
    }
}

impl fmt::Debug for ContextCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.receiver.borrow() {
            Slot::Pending => "pending",
            Slot::Resolved(_) => "resolved",
            Slot::Rejected(_) => "rejected",
        };
        f.debug_struct("ContextCell").field("id", &self.id).field("state", &state).finish()
    }
}
