use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub type SessionId = String;

pub const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Last tree version delivered for this session; a new worker resumes
    /// counting from here.
    #[serde(default)]
    pub tree_version: u64,
    #[serde(skip)]
    revision: u64,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.values == other.values
            && self.created_at == other.created_at
            && self.last_seen_at == other.last_seen_at
            && self.expires_at == other.expires_at
            && self.tree_version == other.tree_version
    }
}

impl Session {
    pub fn new(now: DateTime<Utc>, ttl: Duration) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), now, ttl)
    }

    pub fn with_id(id: impl Into<SessionId>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: id.into(),
            values: BTreeMap::new(),
            created_at: now,
            last_seen_at: now,
            expires_at: now + ttl,
            tree_version: 0,
            revision: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Marks the session as seen and slides its expiry forward.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.last_seen_at = now;
        self.expires_at = now + ttl;
        self.revision += 1;
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub(crate) fn set_value(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
        self.revision += 1;
    }

    /// Versions only move forward.
    pub fn record_version(&mut self, version: u64) {
        if version > self.tree_version {
            self.tree_version = version;
            self.revision += 1;
        }
    }

    /// Bumped on every change; used to decide when to write through.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session backend error: {0}")]
    Backend(String),
    #[error("session {id} expired")]
    Expired { id: SessionId },
    #[error("session {id} not found")]
    NotFound { id: SessionId },
}

/// Storage contract shared by the in-memory and file-backed backends.
pub trait SessionBackend: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Session>, SessionError>;
    fn put(&self, session: &Session) -> Result<(), SessionError>;
    fn delete(&self, id: &str) -> Result<bool, SessionError>;
    fn ids(&self) -> Result<Vec<SessionId>, SessionError>;
}

/// Cleared when the process exits.
#[derive(Debug, Default)]
pub struct MemorySessionBackend {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBackend for MemorySessionBackend {
    fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.get(id).cloned())
    }

    fn put(&self, session: &Session) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, SessionError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.remove(id).is_some())
    }

    fn ids(&self) -> Result<Vec<SessionId>, SessionError> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = sessions.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub session: Session,
    /// True when no usable session existed for the token.
    pub fresh: bool,
}

pub struct SessionManager {
    backend: Arc<dyn SessionBackend>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn SessionBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemorySessionBackend::new()),
            Duration::seconds(DEFAULT_SESSION_TTL_SECS),
        )
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn resolve(&self, token: Option<&str>) -> Resolution {
        self.resolve_at(token, Utc::now())
    }

    /// Never fails: unknown, expired or unreadable tokens yield a new session.
    pub fn resolve_at(&self, token: Option<&str>, now: DateTime<Utc>) -> Resolution {
        if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
            match self.lookup(token, now) {
                Ok(mut session) => {
                    session.touch(now, self.ttl);
                    if let Err(err) = self.backend.put(&session) {
                        warn!(event = "session_touch_failed", session_id = %session.id, error = %err);
                    }
                    return Resolution {
                        session,
                        fresh: false,
                    };
                }
                Err(SessionError::Expired { id }) => {
                    debug!(event = "session_expired", session_id = %id);
                    if let Err(err) = self.backend.delete(&id) {
                        warn!(event = "session_delete_failed", session_id = %id, error = %err);
                    }
                }
                Err(SessionError::NotFound { id }) => {
                    debug!(event = "session_unknown", session_id = %id);
                }
                Err(err) => {
                    warn!(event = "session_lookup_failed", error = %err);
                }
            }
        }

        let session = Session::new(now, self.ttl);
        if let Err(err) = self.backend.put(&session) {
            warn!(event = "session_create_persist_failed", session_id = %session.id, error = %err);
        }
        debug!(event = "session_created", session_id = %session.id);
        Resolution {
            session,
            fresh: true,
        }
    }

    fn lookup(&self, token: &str, now: DateTime<Utc>) -> Result<Session, SessionError> {
        match self.backend.get(token)? {
            Some(session) if session.is_expired(now) => Err(SessionError::Expired { id: session.id }),
            Some(session) => Ok(session),
            None => Err(SessionError::NotFound {
                id: token.to_string(),
            }),
        }
    }

    pub fn persist(&self, session: &Session) -> Result<(), SessionError> {
        self.backend.put(session)
    }

    pub fn remove(&self, id: &str) -> Result<bool, SessionError> {
        self.backend.delete(id)
    }

    pub fn sweep(&self) -> Result<Vec<SessionId>, SessionError> {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>, SessionError> {
        let mut evicted = Vec::new();
        for id in self.backend.ids()? {
            let Some(session) = self.backend.get(&id)? else {
                continue;
            };
            if session.is_expired(now) && self.backend.delete(&id)? {
                evicted.push(id);
            }
        }
        if !evicted.is_empty() {
            debug!(event = "session_sweep", evicted = evicted.len());
        }
        Ok(evicted)
    }
}
