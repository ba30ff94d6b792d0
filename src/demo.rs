//! Demo controllers wired by the `waltz` binary.

use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, Stream};
use log::info;
use serde_json::{json, Value};
use waltz::core::{Channel, Controller, Endpoint, Layout, Listener};
use waltz::Application;

pub const TICK: &str = "tick";
pub const CLOCK: &str = "clock";
pub const CONSOLE: &str = "console";
pub const SESSION_CONTEXT: &str = "session";

pub struct Session {
    pub user: String,
}

impl Session {
    pub fn guest() -> Self {
        Self {
            user: "guest".to_string(),
        }
    }
}

/// Emits `count` increasing numbers, one per `period`.
pub fn ticker(period: Duration, count: u64) -> impl Stream<Item = Result<Value>> + Send + 'static {
    stream::unfold(0_u64, move |n| async move {
        if n >= count {
            return None;
        }
        tokio::time::sleep(period).await;
        Some((Ok(json!(n)), n + 1))
    })
}

pub async fn wait_until_idle(app: &Application) {
    while !app.subscriptions().is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Turns external ticks into in-process clock messages.
pub struct Clock {
    endpoint: Endpoint,
}

impl Clock {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl Controller for Clock {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn config(&self, _app: &Application) -> Result<()> {
        let endpoint = self.endpoint.clone();
        self.endpoint.listen_to(
            TICK,
            Channel::External,
            Listener::new(move |tick| {
                endpoint.dispatch(json!({ "tick": tick, "at": chrono::Local::now().to_rfc3339() }));
            }),
        );
        Ok(())
    }

    fn render(&self, _app: &Application) -> Result<Option<Layout>> {
        Ok(Some(json!({ "id": CLOCK, "template": "--:--:--" })))
    }
}

/// Prints whatever the clock publishes, prefixed with the session user.
pub struct Console {
    endpoint: Endpoint,
}

impl Console {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl Controller for Console {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn config(&self, app: &Application) -> Result<()> {
        let session = app.get_context(SESSION_CONTEXT);
        self.endpoint.listen_to(
            CLOCK,
            Channel::Inproc,
            Listener::new(move |message| {
                let user = session
                    .try_get()
                    .and_then(|value| value.ok())
                    .and_then(|value| value.downcast::<Session>().ok())
                    .map(|session| session.user.clone())
                    .unwrap_or_else(|| "anonymous".to_string());
                info!("[{}] {}", user, message);
            })
            .with_error(|error| log::warn!("Clock failed: {:#}", error)),
        );
        Ok(())
    }

    fn render(&self, _app: &Application) -> Result<Option<Layout>> {
        Ok(Some(json!({ "id": CONSOLE, "view": "list" })))
    }

    fn run(&self, app: &Application) -> Result<()> {
        info!("{} v{} console ready", app.name(), app.version());
        Ok(())
    }
}
