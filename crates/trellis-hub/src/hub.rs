use crate::app::App;
use crate::config::Config;
use crate::connection::Connection;
use crate::sessions::SessionService;
use crate::worker::{spawn_worker, Job, WorkerDirectory, WorkerHandle};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use trellis_core::cell::SubscriptionId;
use trellis_core::protocol::{decode_message, ClientMsg, ServerMsg, ERR_INVALID_MESSAGE};
use trellis_core::session::SessionManager;

pub struct Hub {
    config: Config,
    app: Arc<App>,
    sessions: SessionService,
    directory: Arc<WorkerDirectory>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Connection>>>,
    subscription: SubscriptionId,
}

impl Hub {
    pub fn new(config: Config, app: App, manager: Arc<SessionManager>) -> Arc<Self> {
        let app = Arc::new(app);
        let directory = Arc::new(WorkerDirectory::default());
        let listener = directory.clone();
        let subscription = app
            .store()
            .subscribe_all(move |change| listener.on_change(change));
        let sessions = SessionService::new(manager, config.backend_timeout);
        Arc::new(Self {
            config,
            app,
            sessions,
            directory,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            subscription,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    pub fn workers(&self) -> &WorkerDirectory {
        &self.directory
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    /// Live worker for the token's session, resolving or creating the
    /// session when no worker is running for it.
    pub async fn worker_for(&self, token: Option<&str>) -> WorkerHandle {
        if let Some(handle) = token.and_then(|token| self.directory.get(token)) {
            return handle;
        }
        let resolution = self.sessions.resolve(token.map(str::to_string)).await;
        if resolution.fresh {
            debug!(event = "session_new", session_id = %resolution.session.id);
        }
        spawn_worker(
            self.app.clone(),
            self.sessions.clone(),
            self.directory.clone(),
            resolution.session,
            self.config.idle_worker_timeout,
        )
    }

    /// Queues a job on the session's worker. A worker that stopped taking
    /// jobs is waited out, then replaced once.
    pub async fn dispatch(&self, session_id: &str, job: Job) {
        let handle = self.worker_for(Some(session_id)).await;
        let Err(mpsc::error::SendError(job)) = handle.jobs.send(job).await else {
            return;
        };
        handle.retired().await;
        self.directory.remove(&handle.session_id, handle.generation);
        let retry = self.worker_for(Some(session_id)).await;
        if retry.jobs.send(job).await.is_err() {
            warn!(event = "dispatch_failed", session_id = %session_id);
        }
    }

    async fn register_client(&self, conn: Arc<Connection>) {
        self.clients
            .write()
            .await
            .insert(conn.conn_id.clone(), conn.clone());
        info!(event = "client_connected", conn_id = %conn.conn_id, session_id = %conn.session_id);
    }

    async fn remove_client(&self, conn: &Arc<Connection>, reason: &str) {
        if self.clients.write().await.remove(&conn.conn_id).is_none() {
            return;
        }
        conn.close(reason).await;
        self.dispatch(
            &conn.session_id,
            Job::Detach {
                conn_id: conn.conn_id.clone(),
            },
        )
        .await;
        info!(event = "client_disconnected", conn_id = %conn.conn_id, session_id = %conn.session_id, reason = reason);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Starts the stale connection reaper and the session sweeper.
    pub fn start_background(self: &Arc<Self>) {
        self.clone().start_stale_reaper();
        self.clone().start_session_sweep();
    }

    fn start_stale_reaper(self: Arc<Self>) {
        if self.config.stale_seconds == 0 {
            return;
        }
        let stale_after = Duration::from_secs(self.config.stale_seconds);
        let interval = stale_after / 2;
        let hub = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                let clients = hub
                    .clients
                    .read()
                    .await
                    .values()
                    .cloned()
                    .collect::<Vec<_>>();
                for client in clients {
                    let last_seen = client.last_seen().await;
                    if Instant::now().duration_since(last_seen) > stale_after {
                        warn!(event = "stale_close", conn_id = %client.conn_id);
                        hub.remove_client(&client, "stale").await;
                    }
                }
            }
        });
    }

    fn start_session_sweep(self: Arc<Self>) {
        if self.config.sweep_interval.is_zero() {
            return;
        }
        let interval = self.config.sweep_interval;
        let hub = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                match hub.sessions.sweep().await {
                    Ok(evicted) if !evicted.is_empty() => {
                        info!(event = "sessions_evicted", count = evicted.len());
                    }
                    Ok(_) => {}
                    Err(err) => warn!(event = "session_sweep_failed", error = %err),
                }
            }
        });
    }

    fn start_ping(self: Arc<Self>, conn: Arc<Connection>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        let hub = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if conn.is_closed() {
                    return;
                }
                if !conn.ping().await {
                    warn!(event = "ping_failed", conn_id = %conn.conn_id);
                    if let Some(hub) = hub.upgrade() {
                        hub.remove_client(&conn, "ping_failed").await;
                    }
                    return;
                }
            }
        });
    }

    pub(crate) async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        session_id: String,
        remote: Option<SocketAddr>,
    ) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) if !closing => {}
                    _ => return,
                }
            }
        });

        let conn = Connection::new(self.next_conn_id(), session_id, tx);
        if let Some(remote) = remote {
            debug!(event = "socket_open", conn_id = %conn.conn_id, remote = %remote);
        }
        self.register_client(conn.clone()).await;
        self.clone().start_ping(conn.clone());
        self.dispatch(&conn.session_id, Job::Attach(conn.clone()))
            .await;

        let max_bytes = self.config.max_message_bytes;
        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %conn.conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    debug!(event = "client_close", conn_id = %conn.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    conn.touch().await;
                    continue;
                }
            };
            conn.touch().await;
            if self.config.debug {
                debug!(event = "message_received", conn_id = %conn.conn_id, raw = %String::from_utf8_lossy(&data));
            }
            let msg: ClientMsg = match decode_message(&data, max_bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %conn.conn_id, error = %err);
                    conn.send_msg(&ServerMsg::error(ERR_INVALID_MESSAGE, err.to_string(), None))
                        .await;
                    continue;
                }
            };
            let job = match msg {
                ClientMsg::Event { name, data } => Job::Event {
                    name,
                    data,
                    conn_id: Some(conn.conn_id.clone()),
                    reply: None,
                },
                ClientMsg::State { name, value } => Job::RemoteState {
                    name,
                    value,
                    conn_id: conn.conn_id.clone(),
                },
                ClientMsg::Heartbeat => Job::Heartbeat,
                ClientMsg::Refresh => Job::Refresh {
                    conn_id: conn.conn_id.clone(),
                },
            };
            self.dispatch(&conn.session_id, job).await;
        }

        self.remove_client(&conn, "disconnect").await;
        drop(conn);
        let _ = write_task.await;
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.app.store().unsubscribe(self.subscription);
    }
}
