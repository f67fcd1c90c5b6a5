//! User handler registry.
//!
//! Handlers are keyed by the event name declared on the source (e.g.
//! `"ERC20:Transfer"`); setup handlers are registered separately under the
//! same name and run once per chain before any real event. Names are the
//! dispatch key, so lookup is O(1).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use chainflow_core::error::EngineError;
use chainflow_core::event::Event;

use crate::context::Context;

/// A user indexing function.
#[async_trait]
pub trait IndexingFunction: Send + Sync {
    async fn call(&self, event: &Event, context: &mut Context<'_>) -> Result<(), EngineError>;
}

/// Registry of event and setup handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn IndexingFunction>>,
    setup_handlers: HashMap<String, Arc<dyn IndexingFunction>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an event name.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn IndexingFunction>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register the setup handler for a source name.
    pub fn register_setup(&mut self, name: impl Into<String>, handler: Arc<dyn IndexingFunction>) {
        self.setup_handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn IndexingFunction>> {
        self.handlers.get(name)
    }

    pub fn get_setup(&self, name: &str) -> Option<&Arc<dyn IndexingFunction>> {
        self.setup_handlers.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.setup_handlers.is_empty()
    }
}
