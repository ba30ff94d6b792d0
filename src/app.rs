//! Application orchestration.
//!
//! [`Application`] owns the middleware, the shared context and the registry
//! of external producers, and drives every registered controller through the
//! configure → render → run phases. A phase finishes for all controllers
//! before the next one starts, and a controller whose hook fails or panics
//! is logged and skipped without affecting its siblings.

use std::any::Any;
use std::fmt;
use std::panic;
use std::sync::Arc;

use futures::stream::Stream;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::config::Config;
use crate::core::{
    is_isolating, isolate, panic_message, ApplicationUi, Channel, ContextCell, ContextProvider, ContextStore,
    Controller, Endpoint, Engine, LogEngine, Middleware, Phase, RegistryError, SubscriptionRegistry,
};

/// A failure that escaped every other handler, as seen by the handler
/// passed to [`Application::register_error_handler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncaughtError {
    pub message: String,
    pub location: Option<String>,
}

impl fmt::Display for UncaughtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}", self.message, location),
            None => f.write_str(&self.message),
        }
    }
}

pub struct Application {
    name: String,
    version: String,
    middleware: Middleware,
    context: ContextStore,
    subscriptions: SubscriptionRegistry,
    ui: Option<ApplicationUi>,
    configure_on_register: bool,
}

impl Application {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let middleware = Middleware::new();
        Self {
            name: name.into(),
            version: version.into(),
            subscriptions: SubscriptionRegistry::new(middleware.clone()),
            middleware,
            context: ContextStore::new(),
            ui: None,
            configure_on_register: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut app = Self::new(config.app.name.clone(), config.app.version.clone());
        app.configure_on_register = config.lifecycle.configure_on_register;
        app.middleware.set_trace_messages(config.bus.trace_messages);
        app
    }

    /// Attach the root layout and the engine used during the render phase.
    pub fn with_ui(mut self, ui: ApplicationUi) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn middleware(&self) -> &Middleware {
        &self.middleware
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Bus handle for a controller that is about to be constructed.
    pub fn endpoint(&self, name: impl Into<String>) -> Endpoint {
        self.middleware.endpoint(name)
    }

    /// Observe panics anywhere in the process.
    ///
    /// Installs a panic hook that reports to `handler` and then defers to the
    /// previously installed hook. Panics in lifecycle hooks and listeners
    /// are isolated and logged, so they never reach `handler`.
    pub fn register_error_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(&UncaughtError) + Send + Sync + 'static,
    {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if is_isolating() {
                previous(info);
                return;
            }
            let uncaught = UncaughtError {
                message: panic_message(info.payload()),
                location: info.location().map(|location| location.to_string()),
            };
            handler(&uncaught);
            previous(info);
        }));
        self
    }

    pub fn register_context<T>(&self, id: impl Into<String>, value: T) -> &Self
    where
        T: Any + Send + Sync,
    {
        self.context.register_context(id, value);
        self
    }

    pub fn register_context_provider<P>(&self, id: impl Into<String>, provider: P) -> &Self
    where
        P: ContextProvider + 'static,
    {
        let id = id.into();
        if self.context.provide(id.clone(), provider).is_none() {
            warn!("Context provider for '{}' could not be started", id);
        }
        self
    }

    pub fn get_context(&self, id: impl Into<String>) -> ContextCell {
        self.context.get_context(id)
    }

    pub fn unregister_context(&self, id: &str) -> bool {
        self.context.unregister_context(id)
    }

    pub fn clear_context(&self) {
        self.context.clear_context();
    }

    /// Forward `stream` to `(id, external)`.
    pub fn register_observable<S>(&self, id: impl Into<String>, stream: S) -> Result<&Self, RegistryError>
    where
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        let id = id.into();
        self.register_observable_on(id.clone(), stream, id, Channel::External)
    }

    pub fn register_observable_on<S>(
        &self,
        id: impl Into<String>,
        stream: S,
        topic: impl Into<String>,
        channel: Channel,
    ) -> Result<&Self, RegistryError>
    where
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        self.subscriptions.register(id, stream, topic, channel)?;
        Ok(self)
    }

    /// Build the producer from the application, then forward it to `(id, external)`.
    pub fn register_observable_with<F, S>(&self, id: impl Into<String>, factory: F) -> Result<&Self, RegistryError>
    where
        F: FnOnce(&Application) -> S,
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        let id = id.into();
        if self.subscriptions.is_active(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        let stream = factory(self);
        self.register_observable(id, stream)
    }

    pub fn unregister_observable(&self, id: &str) -> bool {
        self.subscriptions.unregister(id)
    }

    /// Register a controller; a name that is already taken keeps its
    /// original controller.
    ///
    /// With `lifecycle.configure_on_register` the controller's `config` hook
    /// runs right away.
    pub fn register_controller<C>(&self, controller: C) -> &Self
    where
        C: Controller + 'static,
    {
        self.register_shared_controller(Arc::new(controller))
    }

    pub fn register_shared_controller(&self, controller: Arc<dyn Controller>) -> &Self {
        if !controller.endpoint().middleware().ptr_eq(&self.middleware) {
            warn!(
                "Controller '{}' was built for another middleware; its messages will not reach this application",
                controller.name()
            );
        }

        let registration = self.middleware.register_controller(controller);
        if registration.is_added() && self.configure_on_register {
            self.configure_one(registration.controller());
        }
        self
    }

    /// Widgets are controllers that contribute a layout; they share the registry.
    pub fn register_widget<C>(&self, widget: C) -> &Self
    where
        C: Controller + 'static,
    {
        self.register_controller(widget)
    }

    pub fn get_controller(&self, name: &str) -> Option<Arc<dyn Controller>> {
        self.middleware.controller(name)
    }

    pub fn get_widget(&self, name: &str) -> Option<Arc<dyn Controller>> {
        self.get_controller(name)
    }

    /// Run `config` on every controller that has not been configured yet.
    pub fn configure(&self) -> &Self {
        for controller in self.middleware.controllers() {
            self.configure_one(&controller);
        }
        self
    }

    /// Finish configuration, then render the root layout followed by every
    /// controller's layout.
    pub fn render(&self) -> &Self {
        self.configure();

        let engine: Arc<dyn Engine> = match &self.ui {
            Some(ui) => {
                guarded("application layout", "render", || ui.engine().render(ui.layout()));
                ui.engine().clone()
            }
            None => Arc::new(LogEngine),
        };

        for controller in self.middleware.controllers() {
            if !self.middleware.advance(controller.name(), Phase::Rendered) {
                continue;
            }
            let subject = format!("controller '{}'", controller.name());
            let layout = guarded(&subject, "render", || controller.render(self)).flatten();
            if let Some(layout) = layout {
                guarded(&subject, "render", || engine.render(&layout));
            }
        }
        self
    }

    /// Drive every controller through configure, render and run.
    pub fn run(&self) -> &Self {
        self.render();

        info!("Starting {} v{}", self.name, self.version);
        for controller in self.middleware.controllers() {
            if self.middleware.advance(controller.name(), Phase::Running) {
                guarded(&format!("controller '{}'", controller.name()), "run", || controller.run(self));
            }
        }
        self
    }

    fn configure_one(&self, controller: &Arc<dyn Controller>) {
        if self.middleware.advance(controller.name(), Phase::Configured) {
            guarded(&format!("controller '{}'", controller.name()), "configure", || controller.config(self));
        }
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        debug!("Tearing down {}", self.name);
        self.subscriptions.cancel_all();
        self.context.clear_context();
        self.middleware.teardown();
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("middleware", &self.middleware)
            .field("context", &self.context)
            .field("subscriptions", &self.subscriptions.active_ids())
            .finish()
    }
}

/// Run one lifecycle hook, logging instead of propagating failures and panics.
fn guarded<T>(subject: &str, action: &str, hook: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
    match isolate(hook) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!("Failed to {} {}: {:#}", action, subject, e);
            None
        }
        Err(message) => {
            error!("{} panicked during {}: {}", subject, action, message);
            None
        }
    }
}
