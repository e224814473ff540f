//! Reconnecting WebSocket client for a trellis hub.
//!
//! [`Client::connect`] spawns a connection task that keeps a [`View`] of
//! the session's tree in sync, reconnects with exponential backoff and
//! resumes the same session by passing `?session=` on every reconnect.

pub mod mirror;
pub mod policy;

pub use mirror::{Applied, View};
pub use policy::{ErrorIndicator, ReconnectPolicy};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use trellis_core::protocol::{decode_message, encode_message, ClientMsg, ServerMsg};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid hub url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme {0}")]
    Scheme(String),
    #[error("client closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

/// A failure worth showing to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub code: String,
    pub message: String,
    pub name: Option<String>,
}

impl Notice {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Url,
    pub session_id: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    /// Consecutive failures surfaced before the indicator goes quiet.
    pub error_burst: usize,
    pub max_message_bytes: usize,
}

impl ClientConfig {
    pub fn new(url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::Scheme(url.scheme().to_string()));
        }
        Ok(Self {
            url,
            session_id: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(15),
            error_burst: 3,
            max_message_bytes: trellis_core::protocol::DEFAULT_MAX_FRAME_BYTES,
        })
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug)]
enum Command {
    Send(ClientMsg),
    Close,
}

pub struct Client {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    view: watch::Receiver<View>,
    states: watch::Receiver<HashMap<String, Value>>,
    notice: watch::Receiver<Option<Notice>>,
    task: JoinHandle<()>,
}

impl Client {
    /// Starts the connection task. Must be called inside a tokio runtime.
    pub fn connect(config: ClientConfig) -> Self {
        let (commands, rx) = mpsc::channel(64);
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let (view_tx, view) = watch::channel(View::default());
        let (states_tx, states) = watch::channel(HashMap::new());
        let (notice_tx, notice) = watch::channel(None);
        let runner = Runner {
            indicator: ErrorIndicator::new(config.error_burst),
            session_id: config.session_id.clone(),
            config,
            commands: rx,
            pending: VecDeque::new(),
            status: status_tx,
            view: view_tx,
            states: states_tx,
            notice: notice_tx,
        };
        let task = tokio::spawn(runner.run());
        Self {
            commands,
            status,
            view,
            states,
            notice,
            task,
        }
    }

    pub async fn send_event(&self, name: &str, data: Value) -> Result<(), ClientError> {
        self.send(ClientMsg::Event {
            name: name.to_string(),
            data,
        })
        .await
    }

    /// Pushes a synced cell value to the hub.
    pub async fn send_state(&self, name: &str, value: Value) -> Result<(), ClientError> {
        self.send(ClientMsg::State {
            name: name.to_string(),
            value,
        })
        .await
    }

    pub async fn refresh(&self) -> Result<(), ClientError> {
        self.send(ClientMsg::Refresh).await
    }

    async fn send(&self, msg: ClientMsg) -> Result<(), ClientError> {
        self.commands
            .send(Command::Send(msg))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn view(&self) -> watch::Receiver<View> {
        self.view.clone()
    }

    /// Latest value of every synced cell the hub has mirrored.
    pub fn states(&self) -> watch::Receiver<HashMap<String, Value>> {
        self.states.clone()
    }

    pub fn notices(&self) -> watch::Receiver<Option<Notice>> {
        self.notice.clone()
    }

    /// Closes the socket and waits for the connection task to finish.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close).await;
        let _ = self.task.await;
    }
}

enum Exit {
    Closed,
    Dropped,
}

struct Runner {
    config: ClientConfig,
    session_id: Option<String>,
    commands: mpsc::Receiver<Command>,
    /// Messages queued while no socket was open.
    pending: VecDeque<ClientMsg>,
    indicator: ErrorIndicator,
    status: watch::Sender<ConnectionStatus>,
    view: watch::Sender<View>,
    states: watch::Sender<HashMap<String, Value>>,
    notice: watch::Sender<Option<Notice>>,
}

impl Runner {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            let url = session_url(&self.config.url, self.session_id.as_deref());
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    attempt = 0;
                    self.status.send_replace(ConnectionStatus::Connected);
                    info!(event = "client_connected", url = %url);
                    if let Exit::Closed = self.session(ws).await {
                        break;
                    }
                    info!(event = "client_dropped", url = %url);
                }
                Err(err) => {
                    warn!(event = "client_connect_failed", url = %url, error = %err);
                    self.surface(Notice::new("connect_failed", err.to_string()));
                }
            }

            let Some(delay) = self.config.reconnect.delay(attempt) else {
                warn!(event = "client_gave_up", attempts = attempt);
                break;
            };
            attempt += 1;
            self.status
                .send_replace(ConnectionStatus::Reconnecting { attempt });
            if !self.wait(delay).await {
                break;
            }
        }
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    /// Sleeps out the backoff while still queueing outbound messages.
    /// Returns false when the client was closed meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(msg)) => self.pending.push_back(msg),
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    async fn session(&mut self, mut ws: Socket) -> Exit {
        while let Some(msg) = self.pending.pop_front() {
            if !send_msg(&mut ws, &msg).await {
                self.pending.push_front(msg);
                return Exit::Dropped;
            }
        }

        let heartbeats = !self.config.heartbeat_interval.is_zero();
        let period = if heartbeats {
            self.config.heartbeat_interval
        } else {
            Duration::from_secs(3600)
        };
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.on_frame(text.as_bytes()) {
                            if !send_msg(&mut ws, &reply).await {
                                return Exit::Dropped;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Some(reply) = self.on_frame(&bytes) {
                            if !send_msg(&mut ws, &reply).await {
                                return Exit::Dropped;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "client_read_failed", error = %err);
                        return Exit::Dropped;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(msg)) => {
                        if !send_msg(&mut ws, &msg).await {
                            self.pending.push_back(msg);
                            return Exit::Dropped;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = ws.close(None).await;
                        return Exit::Closed;
                    }
                },
                _ = heartbeat.tick(), if heartbeats => {
                    if !send_msg(&mut ws, &ClientMsg::Heartbeat).await {
                        return Exit::Dropped;
                    }
                }
            }
        }
    }

    /// Applies one server frame; returns a message to send back, if any.
    fn on_frame(&mut self, bytes: &[u8]) -> Option<ClientMsg> {
        let msg: ServerMsg = match decode_message(bytes, self.config.max_message_bytes) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(event = "client_frame_invalid", error = %err);
                self.surface(Notice::new("invalid_message", err.to_string()));
                return None;
            }
        };
        match msg {
            ServerMsg::Init {
                version,
                tree,
                session_id,
            } => {
                self.session_id = Some(session_id.clone());
                self.view.send_modify(|view| {
                    view.init(session_id, version, tree);
                });
                self.indicator.record_success();
                None
            }
            ServerMsg::Update { version, patch } => {
                let mut outcome = Applied::Stale;
                self.view.send_if_modified(|view| {
                    outcome = view.update(version, &patch);
                    outcome == Applied::Changed
                });
                match outcome {
                    Applied::Changed => {
                        self.indicator.record_success();
                        None
                    }
                    Applied::Stale => {
                        debug!(event = "client_update_stale", version);
                        None
                    }
                    Applied::OutOfSync(reason) => {
                        warn!(event = "client_out_of_sync", version, reason = %reason);
                        Some(ClientMsg::Refresh)
                    }
                }
            }
            ServerMsg::State { name, value } => {
                self.states.send_modify(|states| {
                    states.insert(name, value);
                });
                None
            }
            ServerMsg::Error {
                code,
                message,
                name,
            } => {
                warn!(event = "client_server_error", code = %code, message = %message);
                self.surface(Notice {
                    code,
                    message,
                    name,
                });
                None
            }
        }
    }

    fn surface(&mut self, notice: Notice) {
        if self.indicator.record_failure() {
            self.notice.send_replace(Some(notice));
        }
    }
}

async fn send_msg(ws: &mut Socket, msg: &ClientMsg) -> bool {
    let text = match encode_message(msg) {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "client_encode_failed", error = %err);
            return true;
        }
    };
    match ws.send(Message::Text(text)).await {
        Ok(()) => true,
        Err(err) => {
            warn!(event = "client_send_failed", error = %err);
            false
        }
    }
}

/// `base` with its `session` query parameter set to `session_id`.
pub fn session_url(base: &Url, session_id: Option<&str>) -> Url {
    let Some(session_id) = session_id else {
        return base.clone();
    };
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != "session")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut url = base.clone();
    url.set_query(None);
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
        pairs.append_pair("session", session_id);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_replaces_existing_session_param() {
        let base = Url::parse("ws://127.0.0.1:8420/ws?theme=dark&session=old").expect("url");
        let url = session_url(&base, Some("new-id"));
        assert_eq!(url.as_str(), "ws://127.0.0.1:8420/ws?theme=dark&session=new-id");
        assert_eq!(session_url(&base, None), base);
    }

    #[test]
    fn config_rejects_non_websocket_urls() {
        assert!(matches!(
            ClientConfig::new("http://localhost/ws"),
            Err(ClientError::Scheme(_))
        ));
        assert!(matches!(ClientConfig::new("not a url"), Err(ClientError::Url(_))));
        let config = ClientConfig::new("ws://localhost:8420/ws")
            .expect("config")
            .with_session("abc");
        assert_eq!(config.session_id.as_deref(), Some("abc"));
    }
}
