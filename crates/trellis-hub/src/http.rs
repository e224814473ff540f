use crate::config::SESSION_COOKIE;
use crate::events::EventError;
use crate::hub::Hub;
use crate::worker::{Fetched, Job};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};
use trellis_core::protocol::ERR_INVALID_MESSAGE;

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/action", get(action_handler))
        .route("/api/ui", get(ui_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

/// Serves the hub until `shutdown` resolves.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    hub: Arc<Hub>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    hub.start_background();
    if let Ok(addr) = listener.local_addr() {
        info!(event = "hub_start", addr = %addr);
    }
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    remote: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(hub): State<Arc<Hub>>,
) -> Response {
    let token = params
        .get("session")
        .cloned()
        .or_else(|| cookie_token(&headers));
    let handle = hub.worker_for(token.as_deref()).await;
    let session_id = handle.session_id.clone();
    let remote = remote.map(|ConnectInfo(addr)| addr);
    let max_bytes = hub.config().max_message_bytes;
    let socket_hub = hub.clone();
    let socket_session = session_id.clone();
    let response = ws
        .max_message_size(max_bytes)
        .on_upgrade(move |socket| async move {
            socket_hub.handle_socket(socket, socket_session, remote).await;
        });
    with_session_cookie(response, &session_id, &hub)
}

async fn action_handler(
    Query(mut params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(hub): State<Arc<Hub>>,
) -> Response {
    let Some(action) = params
        .remove("action")
        .filter(|action| !action.trim().is_empty())
    else {
        return error_response(StatusCode::BAD_REQUEST, ERR_INVALID_MESSAGE, "missing action");
    };
    let token = params.remove("session").or_else(|| cookie_token(&headers));
    let handle = hub.worker_for(token.as_deref()).await;
    let session_id = handle.session_id.clone();

    let data = Value::Object(
        params
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect::<Map<String, Value>>(),
    );
    let (reply, rx) = oneshot::channel();
    hub.dispatch(
        &session_id,
        Job::Event {
            name: action,
            data,
            conn_id: None,
            reply: Some(reply),
        },
    )
    .await;

    let response = match rx.await {
        Ok(Ok(result)) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "session_id": session_id, "result": result })),
        )
            .into_response(),
        Ok(Err(err)) => {
            let status = match err {
                EventError::UnknownEvent { .. } => StatusCode::NOT_FOUND,
                EventError::Handler { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, err.code(), &err.to_string())
        }
        Err(_) => unavailable(),
    };
    with_session_cookie(response, &session_id, &hub)
}

async fn ui_handler(
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(hub): State<Arc<Hub>>,
) -> Response {
    // The tree is always returned whole, so `force` needs no special path.
    let token = params
        .get("session")
        .cloned()
        .or_else(|| cookie_token(&headers));
    let handle = hub.worker_for(token.as_deref()).await;
    let session_id = handle.session_id.clone();

    let (reply, rx) = oneshot::channel();
    hub.dispatch(&session_id, Job::Fetch { reply }).await;
    let response = match rx.await {
        Ok(Fetched {
            session_id,
            version,
            tree: Ok(tree),
        }) => Json(json!({
            "status": "ok",
            "session_id": session_id,
            "version": version,
            "tree": tree,
        }))
        .into_response(),
        Ok(Fetched { tree: Err(err), .. }) => {
            error!(event = "ui_render_failed", session_id = %session_id, error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "render_failed", &err)
        }
        Err(_) => unavailable(),
    };
    with_session_cookie(response, &session_id, &hub)
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "error", "code": code, "message": message })),
    )
        .into_response()
}

fn unavailable() -> Response {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "unavailable",
        "session worker stopped",
    )
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn with_session_cookie(mut response: Response, session_id: &str, hub: &Hub) -> Response {
    let max_age = hub.config().session_ttl.as_secs();
    let cookie = format!("{SESSION_COOKIE}={session_id}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax");
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_token_finds_session_among_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark; trellis_session=abc-123"));
        assert_eq!(cookie_token(&headers).as_deref(), Some("abc-123"));

        let mut empty = HeaderMap::new();
        empty.append(COOKIE, HeaderValue::from_static("trellis_session="));
        assert_eq!(cookie_token(&empty), None);
    }
}
