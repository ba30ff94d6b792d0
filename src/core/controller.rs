use std::fmt;

use anyhow::Result;

use super::endpoint::Endpoint;
use super::engine::Layout;
use crate::app::Application;

/// Lifecycle position of a registered controller.
///
/// Phases only move forward and each hook runs at most once. The application
/// finishes a phase for every controller before starting the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Registered,
    Configured,
    Rendered,
    Running,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Registered => "registered",
            Phase::Configured => "configured",
            Phase::Rendered => "rendered",
            Phase::Running => "running",
        };
        f.write_str(label)
    }
}

/// A named unit of behavior driven by the [`Application`].
///
/// Controllers talk to each other only through their [`Endpoint`]; the
/// endpoint is built by the middleware and handed to the controller when it
/// is constructed. Every hook has a no-op default. Hooks that fail or panic
/// are logged and do not stop the other controllers.
pub trait Controller: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    fn name(&self) -> &str {
        self.endpoint().name()
    }

    /// Subscribe to topics, read context, prepare state.
    fn config(&self, _app: &Application) -> Result<()> {
        Ok(())
    }

    /// Describe this controller's layout; the engine renders whatever is returned.
    fn render(&self, _app: &Application) -> Result<Option<Layout>> {
        Ok(None)
    }

    fn run(&self, _app: &Application) -> Result<()> {
        Ok(())
    }
}
