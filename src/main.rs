mod demo;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use waltz::core::{ApplicationUi, LogEngine};
use waltz::{logger, Application, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    let _logger = logger::init(&config.logging)?;

    let app = Application::from_config(&config).with_ui(ApplicationUi::new(
        json!({"rows": [{"template": "top"}, {"cols": ["left", "main", "right"]}, {"template": "bottom"}]}),
        Arc::new(LogEngine),
    ));

    app.register_error_handler(|error| log::error!("Uncaught failure: {}", error));
    app.register_context(demo::SESSION_CONTEXT, demo::Session::guest());

    app.register_widget(demo::Clock::new(app.endpoint(demo::CLOCK)))
        .register_widget(demo::Console::new(app.endpoint(demo::CONSOLE)));
    app.register_observable(demo::TICK, demo::ticker(Duration::from_millis(500), 5))?;

    app.run();

    tokio::select! {
        _ = demo::wait_until_idle(&app) => log::info!("All producers finished"),
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
    }

    Ok(())
}
