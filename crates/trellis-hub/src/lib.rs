//! WebSocket sync server for trellis apps: per-session workers, event
//! dispatch, HTTP fallback routes and the hub's config and logging.

pub mod app;
pub mod config;
pub mod connection;
pub mod demo;
pub mod events;
pub mod http;
pub mod hub;
pub mod logging;
pub mod sessions;
pub mod worker;

pub use app::{App, AppBuilder, RenderContext, RenderError};
pub use config::Config;
pub use events::{EventContext, EventError, EventHandler, EventRegistry, HandlerError, RegistryError};
pub use http::{router, serve};
pub use hub::Hub;
