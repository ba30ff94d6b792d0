//! Rendering seam.
//!
//! The framework never draws anything itself. During the render phase it
//! hands opaque layout values to an [`Engine`] supplied by the embedding
//! environment.

use std::sync::Arc;

use anyhow::Result;
use log::debug;
use serde_json::Value;

/// Opaque layout description; only the engine interprets it.
pub type Layout = Value;

pub trait Engine: Send + Sync {
    fn render(&self, layout: &Layout) -> Result<()>;
}

/// Engine used when no UI is attached: logs each layout at `debug` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEngine;

impl Engine for LogEngine {
    fn render(&self, layout: &Layout) -> Result<()> {
        debug!("Render layout: {}", layout);
        Ok(())
    }
}

/// Root layout of the application together with the engine that renders it.
#[derive(Clone)]
pub struct ApplicationUi {
    layout: Layout,
    engine: Arc<dyn Engine>,
}

impl ApplicationUi {
    pub fn new(layout: Layout, engine: Arc<dyn Engine>) -> Self {
        Self { layout, engine }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}
