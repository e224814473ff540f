use crate::events::{EventContext, EventHandler, EventRegistry, HandlerError, RegistryError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use trellis_core::cell::{Cell, CellError, CellStore};
use trellis_core::session::Session;
use trellis_core::tree::Node;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Cell(#[from] CellError),
    #[error("render failed: {0}")]
    Failed(String),
}

/// Read-only view handed to the render function.
pub struct RenderContext<'a> {
    store: &'a CellStore,
    session: &'a Session,
}

impl<'a> RenderContext<'a> {
    pub fn new(store: &'a CellStore, session: &'a Session) -> Self {
        Self { store, session }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn get<T: DeserializeOwned>(&self, cell: &Cell<T>) -> Result<T, CellError> {
        self.store.get(cell, Some(self.session))
    }
}

pub type RenderFn = Arc<dyn Fn(&RenderContext<'_>) -> Result<Node, RenderError> + Send + Sync>;

/// A runnable app: its cell store, event handlers and render function.
pub struct App {
    store: Arc<CellStore>,
    events: EventRegistry,
    render: RenderFn,
}

impl App {
    pub fn builder<F>(store: Arc<CellStore>, render: F) -> AppBuilder
    where
        F: Fn(&RenderContext<'_>) -> Result<Node, RenderError> + Send + Sync + 'static,
    {
        AppBuilder {
            store,
            events: EventRegistry::new(),
            render: Arc::new(render),
            error: None,
        }
    }

    pub fn store(&self) -> &Arc<CellStore> {
        &self.store
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    /// Renders the tree for one session. A panicking render is reported as
    /// a failure instead of unwinding into the session worker.
    pub fn render(&self, session: &Session) -> Result<Node, RenderError> {
        let ctx = RenderContext::new(&self.store, session);
        match std::panic::catch_unwind(AssertUnwindSafe(|| (self.render)(&ctx))) {
            Ok(result) => result,
            Err(panic) => Err(RenderError::Failed(crate::events::panic_message(
                panic.as_ref(),
            ))),
        }
    }
}

pub struct AppBuilder {
    store: Arc<CellStore>,
    events: EventRegistry,
    render: RenderFn,
    error: Option<RegistryError>,
}

impl AppBuilder {
    pub fn event<H>(mut self, name: &str, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        if self.error.is_none() {
            self.error = self.events.register(name, handler).err();
        }
        self
    }

    pub fn event_fn<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut EventContext<'_>, Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        if self.error.is_none() {
            self.error = self.events.register_fn(name, f).err();
        }
        self
    }

    /// Fails with the first registration error, if any.
    pub fn build(self) -> Result<App, RegistryError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(App {
            store: self.store,
            events: self.events,
            render: self.render,
        })
    }
}
