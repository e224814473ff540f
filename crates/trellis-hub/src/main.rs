use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use trellis_core::cell::CellStore;
use trellis_hub::config::load_config;
use trellis_hub::demo::counter_app;
use trellis_hub::logging::init_logging;
use trellis_hub::sessions::build_session_manager;
use trellis_hub::{serve, Hub};

#[tokio::main]
async fn main() {
    let config = load_config();
    if let Some(path) = init_logging(&config) {
        info!(event = "log_file", path = %path.display());
    }
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        warn!(event = "non_loopback_bind", addr = %config.addr);
    }

    let manager = match build_session_manager(&config) {
        Ok(manager) => Arc::new(manager),
        Err(err) => {
            error!(event = "session_store_error", error = %err);
            return;
        }
    };
    let app = match counter_app(Arc::new(CellStore::new())) {
        Ok(app) => app,
        Err(err) => {
            error!(event = "app_error", error = %err);
            return;
        }
    };
    let hub = Hub::new(config.clone(), app, manager);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(event = "hub_config", session_store = ?config.session_store, session_ttl_secs = config.session_ttl.as_secs());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    if let Err(err) = serve(listener, hub, shutdown).await {
        error!(event = "hub_error", error = %err);
    }
}
