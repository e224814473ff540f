//! Per-session workers.
//!
//! Every live session gets one task that owns the session record, its open
//! connections and the last delivered tree. Handlers, renders and sends for
//! a session run on that task one at a time; different sessions proceed
//! independently. Cell changes only flag a worker dirty, so bursts of writes
//! collapse into a single render.

use crate::app::App;
use crate::connection::Connection;
use crate::events::{EventContext, EventError};
use crate::sessions::SessionService;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use trellis_core::cell::{CellChange, CellError};
use trellis_core::diff::diff;
use trellis_core::patch::{is_root_replace, Patch};
use trellis_core::protocol::{
    encode_message, ServerMsg, ERR_INVALID_MESSAGE, ERR_RENDER_FAILED, ERR_UNKNOWN_CELL,
};
use trellis_core::session::{Session, SessionId};
use trellis_core::tree::Node;

const JOB_QUEUE_DEPTH: usize = 64;

pub enum Job {
    Attach(Arc<Connection>),
    Detach {
        conn_id: String,
    },
    Event {
        name: String,
        data: Value,
        conn_id: Option<String>,
        reply: Option<oneshot::Sender<Result<Value, EventError>>>,
    },
    RemoteState {
        name: String,
        value: Value,
        conn_id: String,
    },
    Heartbeat,
    Refresh {
        conn_id: String,
    },
    Fetch {
        reply: oneshot::Sender<Fetched>,
    },
}

/// Result of an HTTP tree fetch.
pub struct Fetched {
    pub session_id: SessionId,
    pub version: u64,
    pub tree: Result<Node, String>,
}

#[derive(Default)]
pub(crate) struct WorkerSignal {
    dirty: AtomicBool,
    states: Mutex<Vec<(String, Value)>>,
    notify: Notify,
}

impl WorkerSignal {
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn push_state(&self, name: &str, value: &Value) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), value.clone()));
        self.notify.notify_one();
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    fn take_states(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.states.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Clone)]
pub struct WorkerHandle {
    pub session_id: SessionId,
    pub(crate) generation: u64,
    pub(crate) jobs: mpsc::Sender<Job>,
    pub(crate) signal: Arc<WorkerSignal>,
    retired: watch::Receiver<bool>,
}

impl WorkerHandle {
    /// Resolves once the worker has drained its queue, persisted the
    /// session and left the directory.
    pub(crate) async fn retired(&self) {
        let mut retired = self.retired.clone();
        let _ = retired.wait_for(|done| *done).await;
    }
}

/// Live workers by session id. Also the cell store listener that decides
/// which sessions a change reaches.
#[derive(Default)]
pub struct WorkerDirectory {
    workers: RwLock<HashMap<SessionId, WorkerHandle>>,
    generations: AtomicU64,
}

impl WorkerDirectory {
    pub fn get(&self, session_id: &str) -> Option<WorkerHandle> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the handle that ended up registered for the session.
    fn insert_if_absent(&self, handle: WorkerHandle) -> WorkerHandle {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        workers
            .entry(handle.session_id.clone())
            .or_insert(handle)
            .clone()
    }

    pub(crate) fn remove(&self, session_id: &str, generation: u64) {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        if workers
            .get(session_id)
            .is_some_and(|handle| handle.generation == generation)
        {
            workers.remove(session_id);
        }
    }

    /// Session-scoped writes reach only their session; shared values reach
    /// every live session. Synced values are mirrored as `state`, except
    /// back to the session a remote write came from.
    pub fn on_change(&self, change: &CellChange) {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        let mirror = |session_id: &str, handle: &WorkerHandle| {
            handle.signal.mark_dirty();
            if let Some(name) = change.name.as_deref() {
                if change.synced && !change.origin.is_remote_from(session_id) {
                    handle.signal.push_state(name, &change.value);
                }
            }
        };
        match change.session.as_deref() {
            Some(session_id) => {
                if let Some(handle) = workers.get(session_id) {
                    mirror(session_id, handle);
                }
            }
            None => {
                for (session_id, handle) in workers.iter() {
                    mirror(session_id, handle);
                }
            }
        }
    }
}

pub(crate) struct Worker {
    app: Arc<App>,
    sessions: SessionService,
    directory: Arc<WorkerDirectory>,
    generation: u64,
    signal: Arc<WorkerSignal>,
    retired: watch::Sender<bool>,
    session: Session,
    persisted_revision: u64,
    connections: Vec<Arc<Connection>>,
    snapshot: Option<Node>,
    version: u64,
    idle_timeout: Duration,
    idle_since: Option<Instant>,
}

/// Starts a worker for `session` unless one is already registered, and
/// returns whichever handle is live.
pub(crate) fn spawn_worker(
    app: Arc<App>,
    sessions: SessionService,
    directory: Arc<WorkerDirectory>,
    session: Session,
    idle_timeout: Duration,
) -> WorkerHandle {
    if let Some(existing) = directory.get(&session.id) {
        return existing;
    }
    let (tx, rx) = mpsc::channel(JOB_QUEUE_DEPTH);
    let signal = Arc::new(WorkerSignal::default());
    let (retired_tx, retired_rx) = watch::channel(false);
    let handle = WorkerHandle {
        session_id: session.id.clone(),
        generation: directory.next_generation(),
        jobs: tx,
        signal: signal.clone(),
        retired: retired_rx,
    };
    let registered = directory.insert_if_absent(handle.clone());
    if registered.generation != handle.generation {
        return registered;
    }

    let worker = Worker {
        app,
        sessions,
        directory,
        generation: handle.generation,
        signal,
        retired: retired_tx,
        persisted_revision: session.revision(),
        version: session.tree_version,
        session,
        connections: Vec::new(),
        snapshot: None,
        idle_timeout,
        idle_since: Some(Instant::now()),
    };
    tokio::spawn(worker.run(rx));
    handle
}

impl Worker {
    async fn run(mut self, mut jobs: mpsc::Receiver<Job>) {
        debug!(event = "worker_start", session_id = %self.session.id);
        let signal = self.signal.clone();
        loop {
            let deadline = self
                .idle_since
                .map(|since| since + self.idle_timeout)
                .unwrap_or_else(|| Instant::now() + self.idle_timeout);
            let idle = self.idle_since.is_some();
            let job = tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => Some(job),
                    None => break,
                },
                _ = signal.notify.notified() => None,
                _ = tokio::time::sleep_until(deadline), if idle => match jobs.try_recv() {
                    Ok(job) => Some(job),
                    Err(_) => break,
                },
            };
            if let Some(job) = job {
                self.handle(job).await;
            }
            self.flush().await;
            self.persist_if_changed().await;
        }

        // Stop intake, finish what is queued and persist before leaving the
        // directory; a replacement worker must load the final session.
        jobs.close();
        while let Some(job) = jobs.recv().await {
            if let Job::Attach(conn) = job {
                // Raced the shutdown; the client reconnects to the next worker.
                conn.close("worker_stopped").await;
                continue;
            }
            self.handle(job).await;
            self.flush().await;
        }
        self.persist_if_changed().await;
        self.directory.remove(&self.session.id, self.generation);
        self.retired.send_replace(true);
        debug!(event = "worker_stop", session_id = %self.session.id);
    }

    async fn handle(&mut self, job: Job) {
        match job {
            Job::Attach(conn) => {
                self.idle_since = None;
                self.session
                    .touch(chrono::Utc::now(), self.sessions.ttl());
                info!(event = "connection_attached", session_id = %self.session.id, conn_id = %conn.conn_id);
                self.connections.push(conn.clone());
                self.sync_connection(&conn).await;
            }
            Job::Detach { conn_id } => {
                self.connections.retain(|conn| conn.conn_id != conn_id);
                if self.connections.is_empty() {
                    self.idle_since = Some(Instant::now());
                }
            }
            Job::Event {
                name,
                data,
                conn_id,
                reply,
            } => {
                self.bump_idle();
                self.session
                    .touch(chrono::Utc::now(), self.sessions.ttl());
                let app = self.app.clone();
                let result = {
                    let mut ctx = EventContext::new(app.store(), &mut self.session);
                    app.events().dispatch(&name, &mut ctx, data).await
                };
                if let Err(err) = &result {
                    warn!(event = "event_failed", session_id = %self.session.id, name = %name, error = %err);
                    if let Some(conn) = conn_id.as_deref().and_then(|id| self.connection(id)) {
                        conn.send_msg(&ServerMsg::error(err.code(), err.to_string(), Some(err.name())))
                            .await;
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Job::RemoteState {
                name,
                value,
                conn_id,
            } => {
                let app = self.app.clone();
                if let Err(err) = app.store().apply_remote(&name, &mut self.session, value) {
                    let code = match err {
                        CellError::InvalidCell(_) | CellError::NotSynced { .. } => ERR_UNKNOWN_CELL,
                        _ => ERR_INVALID_MESSAGE,
                    };
                    warn!(event = "remote_state_rejected", session_id = %self.session.id, name = %name, error = %err);
                    if let Some(conn) = self.connection(&conn_id) {
                        conn.send_msg(&ServerMsg::error(code, err.to_string(), Some(&name)))
                            .await;
                    }
                }
            }
            Job::Heartbeat => {
                self.session
                    .touch(chrono::Utc::now(), self.sessions.ttl());
            }
            Job::Refresh { conn_id } => {
                if let Some(conn) = self.connection(&conn_id) {
                    self.sync_connection(&conn).await;
                }
            }
            Job::Fetch { reply } => {
                self.bump_idle();
                let tree = match self.app.render(&self.session) {
                    Ok(tree) => {
                        if let Some(msg) = self.advance(tree.clone()) {
                            self.broadcast(&msg, None).await;
                        }
                        Ok(tree)
                    }
                    Err(err) => Err(err.to_string()),
                };
                let _ = reply.send(Fetched {
                    session_id: self.session.id.clone(),
                    version: self.version,
                    tree,
                });
            }
        }
    }

    fn bump_idle(&mut self) {
        if self.idle_since.is_some() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn connection(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .find(|conn| conn.conn_id == conn_id)
            .cloned()
    }

    /// Renders if anything changed and pushes pending `state` mirrors.
    async fn flush(&mut self) {
        let states = self.signal.take_states();
        if self.signal.take_dirty() && !self.connections.is_empty() {
            match self.app.render(&self.session) {
                Ok(tree) => {
                    if let Some(msg) = self.advance(tree) {
                        self.broadcast(&msg, None).await;
                    }
                }
                Err(err) => {
                    warn!(event = "render_failed", session_id = %self.session.id, error = %err);
                    let msg = ServerMsg::error(ERR_RENDER_FAILED, err.to_string(), None);
                    self.broadcast(&msg, None).await;
                }
            }
        }
        for (name, value) in states {
            self.broadcast(&ServerMsg::State { name, value }, None).await;
        }
    }

    /// Brings one connection up to date with a full `init`. Other
    /// connections get the diff first so every client shares one version.
    async fn sync_connection(&mut self, conn: &Arc<Connection>) {
        let tree = match self.app.render(&self.session) {
            Ok(tree) => tree,
            Err(err) => {
                warn!(event = "render_failed", session_id = %self.session.id, error = %err);
                conn.send_msg(&ServerMsg::error(ERR_RENDER_FAILED, err.to_string(), None))
                    .await;
                return;
            }
        };
        if let Some(msg) = self.advance(tree) {
            self.broadcast(&msg, Some(&conn.conn_id)).await;
        }
        if let Some(tree) = self.snapshot.clone() {
            let init = ServerMsg::Init {
                version: self.version,
                tree,
                session_id: self.session.id.clone(),
            };
            if !conn.send_msg(&init).await {
                self.connections.retain(|other| other.conn_id != conn.conn_id);
            }
        }
    }

    /// Diffs `tree` against the snapshot. On change bumps the version,
    /// stores the tree and returns the message that carries it.
    fn advance(&mut self, tree: Node) -> Option<ServerMsg> {
        let patch = diff(self.snapshot.as_ref(), &tree);
        if patch.is_empty() {
            return None;
        }
        self.version += 1;
        self.session.record_version(self.version);
        let msg = if is_root_replace(&patch) || patch_outweighs_tree(&patch, &tree) {
            ServerMsg::Init {
                version: self.version,
                tree: tree.clone(),
                session_id: self.session.id.clone(),
            }
        } else {
            ServerMsg::Update {
                version: self.version,
                patch,
            }
        };
        self.snapshot = Some(tree);
        Some(msg)
    }

    async fn broadcast(&mut self, msg: &ServerMsg, skip: Option<&str>) {
        if self.connections.is_empty() {
            return;
        }
        let text = match encode_message(msg) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_failed", session_id = %self.session.id, error = %err);
                return;
            }
        };
        let mut dead = Vec::new();
        for conn in &self.connections {
            if skip == Some(conn.conn_id.as_str()) {
                continue;
            }
            if !conn.send_text(text.clone()).await {
                dead.push(conn.conn_id.clone());
            }
        }
        if !dead.is_empty() {
            debug!(event = "connections_dropped", session_id = %self.session.id, count = dead.len());
            self.connections.retain(|conn| !dead.contains(&conn.conn_id));
            if self.connections.is_empty() {
                self.idle_since = Some(Instant::now());
            }
        }
    }

    async fn persist_if_changed(&mut self) {
        let revision = self.session.revision();
        if revision == self.persisted_revision {
            return;
        }
        match self.sessions.persist(self.session.clone()).await {
            Ok(()) => self.persisted_revision = revision,
            Err(err) => {
                warn!(event = "session_persist_failed", session_id = %self.session.id, error = %err)
            }
        }
    }
}

fn patch_outweighs_tree(patch: &Patch, tree: &Node) -> bool {
    match (serde_json::to_vec(patch), serde_json::to_vec(tree)) {
        (Ok(patch), Ok(tree)) => patch.len() > tree.len(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::cell::{Origin, Scope};

    fn handle(directory: &WorkerDirectory, session_id: &str) -> Arc<WorkerSignal> {
        let (tx, _rx) = mpsc::channel(1);
        let signal = Arc::new(WorkerSignal::default());
        let (_retired_tx, retired) = watch::channel(false);
        directory.insert_if_absent(WorkerHandle {
            session_id: session_id.to_string(),
            generation: directory.next_generation(),
            jobs: tx,
            signal: signal.clone(),
            retired,
        });
        signal
    }

    fn change(session: Option<&str>, origin: Origin, synced: bool) -> CellChange {
        CellChange {
            cell: 0,
            name: Some("query".to_string()),
            scope: if session.is_some() {
                Scope::Session
            } else {
                Scope::Global
            },
            session: session.map(str::to_string),
            value: Value::from("rust"),
            origin,
            synced,
        }
    }

    #[test]
    fn session_changes_reach_only_their_session() {
        let directory = WorkerDirectory::default();
        let s1 = handle(&directory, "s1");
        let s2 = handle(&directory, "s2");

        directory.on_change(&change(Some("s1"), Origin::Local, false));
        assert!(s1.take_dirty());
        assert!(!s2.take_dirty());

        directory.on_change(&change(None, Origin::Local, false));
        assert!(s1.take_dirty());
        assert!(s2.take_dirty());
    }

    #[test]
    fn synced_values_skip_the_remote_origin() {
        let directory = WorkerDirectory::default();
        let s1 = handle(&directory, "s1");
        let s2 = handle(&directory, "s2");

        directory.on_change(&change(Some("s1"), Origin::Remote("s1".to_string()), true));
        assert!(s1.take_dirty());
        assert!(s1.take_states().is_empty());

        directory.on_change(&change(None, Origin::Remote("s1".to_string()), true));
        assert!(s1.take_states().is_empty());
        assert_eq!(
            s2.take_states(),
            vec![("query".to_string(), Value::from("rust"))]
        );

        directory.on_change(&change(Some("s1"), Origin::Local, true));
        assert_eq!(s1.take_states().len(), 1);
    }

    #[test]
    fn stale_generation_does_not_unregister_replacement() {
        let directory = WorkerDirectory::default();
        handle(&directory, "s1");
        let current = directory.get("s1").expect("registered");
        directory.remove("s1", current.generation + 1);
        assert_eq!(directory.len(), 1);
        directory.remove("s1", current.generation);
        assert!(directory.is_empty());
    }

    #[test]
    fn large_patches_fall_back_to_full_tree() {
        let tree = Node::text("x");
        let small: Patch = Vec::new();
        assert!(!patch_outweighs_tree(&small, &tree));
        let patch = diff(Some(&Node::new("div").child(Node::text("a")).child(Node::text("b"))), &tree);
        assert!(is_root_replace(&patch));
    }
}
