use crate::config::{Config, SessionStoreKind};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use trellis_core::session::{
    MemorySessionBackend, Resolution, Session, SessionBackend, SessionError, SessionId,
    SessionManager,
};
use trellis_storage::{SqliteSessionBackend, StorageError};

pub fn build_session_manager(config: &Config) -> Result<SessionManager, StorageError> {
    let backend: Arc<dyn SessionBackend> = match config.session_store {
        SessionStoreKind::Memory => Arc::new(MemorySessionBackend::new()),
        SessionStoreKind::Sqlite => {
            if let Some(parent) = config.session_db.parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            info!(event = "session_store_open", path = %config.session_db.display());
            Arc::new(SqliteSessionBackend::open(&config.session_db)?)
        }
    };
    Ok(SessionManager::new(backend, config.session_ttl_chrono()))
}

/// Runs session manager calls on the blocking pool, bounded by a timeout,
/// so backend I/O never stalls connection tasks.
#[derive(Clone)]
pub struct SessionService {
    manager: Arc<SessionManager>,
    timeout: Duration,
}

impl SessionService {
    pub fn new(manager: Arc<SessionManager>, timeout: Duration) -> Self {
        Self { manager, timeout }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.manager.ttl()
    }

    /// Falls back to an unsaved new session when the backend is too slow.
    pub async fn resolve(&self, token: Option<String>) -> Resolution {
        let manager = self.manager.clone();
        let task = tokio::task::spawn_blocking(move || manager.resolve(token.as_deref()));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(err)) => {
                warn!(event = "session_resolve_failed", error = %err);
                self.fallback()
            }
            Err(_) => {
                warn!(event = "session_resolve_timeout", timeout_ms = self.timeout.as_millis() as u64);
                self.fallback()
            }
        }
    }

    pub async fn persist(&self, session: Session) -> Result<(), SessionError> {
        let manager = self.manager.clone();
        self.run(move || manager.persist(&session)).await
    }

    pub async fn sweep(&self) -> Result<Vec<SessionId>, SessionError> {
        let manager = self.manager.clone();
        self.run(move || manager.sweep()).await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, SessionError> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(SessionError::Backend(err.to_string())),
            Err(_) => Err(SessionError::Backend(format!(
                "session backend timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    fn fallback(&self) -> Resolution {
        Resolution {
            session: Session::new(Utc::now(), self.manager.ttl()),
            fresh: true,
        }
    }
}
