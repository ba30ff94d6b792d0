//! Waltz - message routing and lifecycle substrate for client-side applications
//!
//! This library provides the plumbing a component-based UI (or any other
//! consumer) is built on: a topic/channel publish/subscribe bus, a deferred
//! shared context, a bridge for external asynchronous producers, and the
//! configure → render → run lifecycle of named controllers.
//!
//! # Modules
//!
//! * [`app`] - Application orchestration and lifecycle phases
//! * [`config`] - Application configuration management
//! * [`core`] - Bus, context, producers and the controller abstraction
//! * [`logger`] - Logging backend and in-memory log buffer
//!
//! # Example
//!
//! ```no_run
//! use waltz::app::Application;
//! use waltz::core::{Controller, Endpoint, Listener};
//!
//! struct Greeter {
//!     endpoint: Endpoint,
//! }
//!
//! impl Controller for Greeter {
//!     fn endpoint(&self) -> &Endpoint {
//!         &self.endpoint
//!     }
//!
//!     fn run(&self, _app: &Application) -> anyhow::Result<()> {
//!         self.endpoint.dispatch("hello");
//!         Ok(())
//!     }
//! }
//!
//! let app = Application::new("demo", "1.0.0");
//! app.middleware().subscribe("greeter", Default::default(), Listener::new(|value| println!("{value}")));
//! app.register_controller(Greeter { endpoint: app.endpoint("greeter") }).run();
//! ```

/// Application orchestration
pub mod app;

/// Configuration module for managing application settings
pub mod config;

/// Framework constants and default values
pub mod constants;

/// Message bus, context store, producer registry and controllers
pub mod core;

/// Logging utilities for debugging and error tracking
pub mod logger;

pub use app::{Application, UncaughtError};
pub use config::Config;
