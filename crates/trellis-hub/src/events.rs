//! Named event handlers invoked by WebSocket `event` messages and the HTTP
//! action fallback.

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use trellis_core::cell::{Cell, CellError, CellStore};
use trellis_core::protocol::{ERR_HANDLER_FAILED, ERR_UNKNOWN_EVENT};
use trellis_core::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("event {name} is already registered")]
    Duplicate { name: String },
    #[error("invalid event name {name:?}")]
    InvalidName { name: String },
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Cell(#[from] CellError),
    #[error("invalid event data: {0}")]
    InvalidData(String),
    #[error("{0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("no handler registered for event {name}")]
    UnknownEvent { name: String },
    #[error("handler for event {name} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: HandlerError,
    },
}

impl EventError {
    /// Wire error code reported to the client.
    pub fn code(&self) -> &'static str {
        match self {
            EventError::UnknownEvent { .. } => ERR_UNKNOWN_EVENT,
            EventError::Handler { .. } => ERR_HANDLER_FAILED,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EventError::UnknownEvent { name } | EventError::Handler { name, .. } => name,
        }
    }
}

/// What a handler sees: the app's store and the caller's session.
pub struct EventContext<'a> {
    store: &'a CellStore,
    session: &'a mut Session,
}

impl<'a> EventContext<'a> {
    pub fn new(store: &'a CellStore, session: &'a mut Session) -> Self {
        Self { store, session }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn store(&self) -> &CellStore {
        self.store
    }

    pub fn get<T: DeserializeOwned>(&self, cell: &Cell<T>) -> Result<T, CellError> {
        self.store.get(cell, Some(&*self.session))
    }

    pub fn set<T: Serialize>(&mut self, cell: &Cell<T>, value: T) -> Result<bool, CellError> {
        self.store.set(cell, Some(&mut *self.session), value)
    }

    pub fn update<T, F>(&mut self, cell: &Cell<T>, f: F) -> Result<bool, CellError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        self.store.update(cell, Some(&mut *self.session), f)
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &mut EventContext<'_>, data: Value) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&mut EventContext<'_>, Value) -> Result<Value, HandlerError> + Send + Sync,
{
    async fn handle(&self, ctx: &mut EventContext<'_>, data: Value) -> Result<Value, HandlerError> {
        (self.0)(ctx, data)
    }
}

#[derive(Default, Clone)]
pub struct EventRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, name: &str, handler: H) -> Result<(), RegistryError>
    where
        H: EventHandler + 'static,
    {
        if !valid_event_name(name) {
            return Err(RegistryError::InvalidName {
                name: name.to_string(),
            });
        }
        if self.handlers.contains_key(name) {
            return Err(RegistryError::Duplicate {
                name: name.to_string(),
            });
        }
        self.handlers.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Registers a synchronous closure.
    pub fn register_fn<F>(&mut self, name: &str, f: F) -> Result<(), RegistryError>
    where
        F: Fn(&mut EventContext<'_>, Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(name, FnHandler(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs the handler for `name`. Unknown names and handler failures,
    /// panics included, come back as values.
    pub async fn dispatch(
        &self,
        name: &str,
        ctx: &mut EventContext<'_>,
        data: Value,
    ) -> Result<Value, EventError> {
        let handler = self
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| EventError::UnknownEvent {
                name: name.to_string(),
            })?;

        let outcome = AssertUnwindSafe(handler.handle(ctx, data))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(EventError::Handler {
                name: name.to_string(),
                source,
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(event = "handler_panic", name = name, message = %message);
                Err(EventError::Handler {
                    name: name.to_string(),
                    source: HandlerError::Panicked(message),
                })
            }
        }
    }
}

fn valid_event_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':' | '/'))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use trellis_core::cell::Scope;

    struct Slow;

    #[async_trait]
    impl EventHandler for Slow {
        async fn handle(
            &self,
            ctx: &mut EventContext<'_>,
            data: Value,
        ) -> Result<Value, HandlerError> {
            tokio::task::yield_now().await;
            Ok(serde_json::json!({ "session": ctx.session_id(), "echo": data }))
        }
    }

    fn session() -> Session {
        Session::with_id("s1", Utc::now(), Duration::hours(1))
    }

    #[test]
    fn registration_rejects_duplicates_and_bad_names() {
        let mut registry = EventRegistry::new();
        registry
            .register_fn("increment", |_, _| Ok(Value::Null))
            .expect("register");
        assert_eq!(
            registry.register_fn("increment", |_, _| Ok(Value::Null)),
            Err(RegistryError::Duplicate {
                name: "increment".to_string()
            })
        );
        assert!(matches!(
            registry.register("has space", Slow),
            Err(RegistryError::InvalidName { .. })
        ));
        assert!(matches!(
            registry.register("", Slow),
            Err(RegistryError::InvalidName { .. })
        ));
        assert_eq!(registry.names(), vec!["increment".to_string()]);
    }

    #[tokio::test]
    async fn unknown_event_is_reported_not_raised() {
        let registry = EventRegistry::new();
        let store = CellStore::new();
        let mut session = session();
        let mut ctx = EventContext::new(&store, &mut session);

        let err = registry
            .dispatch("does_not_exist", &mut ctx, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::UnknownEvent { ref name } if name == "does_not_exist"));
        assert_eq!(err.code(), "unknown_event");
    }

    #[tokio::test]
    async fn handlers_mutate_the_callers_session() {
        let store = CellStore::new();
        let counter = store
            .declare(Some("counter"), 0i64, Scope::Session)
            .expect("declare");
        let mut registry = EventRegistry::new();
        let handle = counter.clone();
        registry
            .register_fn("increment", move |ctx, _| {
                ctx.update(&handle, |n| n + 1)?;
                Ok(Value::from(ctx.get(&handle)?))
            })
            .expect("register");
        registry.register("slow", Slow).expect("register");

        let mut session = session();
        let mut ctx = EventContext::new(&store, &mut session);
        let value = registry
            .dispatch("increment", &mut ctx, Value::Null)
            .await
            .expect("dispatch");
        assert_eq!(value, Value::from(1));

        let echoed = registry
            .dispatch("slow", &mut ctx, Value::from("x"))
            .await
            .expect("dispatch");
        assert_eq!(echoed["session"], "s1");
        assert_eq!(store.get(&counter, Some(&session)).expect("get"), 1);
    }

    #[tokio::test]
    async fn failures_and_panics_become_handler_errors() {
        let mut registry = EventRegistry::new();
        registry
            .register_fn("fail", |_, _| Err(HandlerError::failed("nope")))
            .expect("register");
        registry
            .register_fn("boom", |_, _| panic!("kaboom"))
            .expect("register");

        let store = CellStore::new();
        let mut session = session();
        let mut ctx = EventContext::new(&store, &mut session);

        let err = registry
            .dispatch("fail", &mut ctx, Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "handler_failed");

        let err = registry
            .dispatch("boom", &mut ctx, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::Handler { source: HandlerError::Panicked(ref message), .. } if message == "kaboom"
        ));
    }
}
