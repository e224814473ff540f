use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use trellis_core::protocol::DEFAULT_MAX_FRAME_BYTES;
use trellis_core::session::DEFAULT_SESSION_TTL_SECS;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8420";
pub const SESSION_COOKIE: &str = "trellis_session";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SessionStoreKind {
    Memory,
    Sqlite,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub debug: bool,
    pub session_store: SessionStoreKind,
    pub session_db: PathBuf,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub stale_seconds: u64,
    pub backend_timeout: Duration,
    /// How long a session worker with no connections lingers before exiting.
    pub idle_worker_timeout: Duration,
    pub max_message_bytes: usize,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            debug: false,
            session_store: SessionStoreKind::Memory,
            session_db: PathBuf::from(".trellis/sessions.db"),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS as u64),
            sweep_interval: Duration::from_secs(300),
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            stale_seconds: 30,
            backend_timeout: Duration::from_millis(2000),
            idle_worker_timeout: Duration::from_secs(60),
            max_message_bytes: DEFAULT_MAX_FRAME_BYTES,
            log_dir: String::new(),
        }
    }
}

impl Config {
    pub fn session_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_SESSION_TTL_SECS))
    }
}

#[derive(Parser, Debug)]
#[command(name = "trellis-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, value_enum)]
    pub session_store: Option<SessionStoreKind>,
    #[arg(long, default_value = "")]
    pub session_db: String,
    #[arg(long, default_value_t = DEFAULT_SESSION_TTL_SECS as u64)]
    pub session_ttl: u64,
    #[arg(long, default_value_t = 300)]
    pub sweep_interval: u64,
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 30)]
    pub stale_seconds: u64,
    #[arg(long, default_value_t = 2000)]
    pub backend_timeout_ms: u64,
    #[arg(long, default_value_t = 60)]
    pub idle_worker_seconds: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_message_bytes: usize,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

pub fn load_config() -> Config {
    Config::from_args(Args::parse())
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        Self {
            addr: resolve_addr(&args.addr),
            debug: args.debug || env_true("TRELLIS_DEBUG"),
            session_store: resolve_session_store(args.session_store),
            session_db: resolve_session_db(&args.session_db),
            session_ttl: Duration::from_secs(args.session_ttl.max(1)),
            sweep_interval: Duration::from_secs(args.sweep_interval),
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout.max(1)),
            stale_seconds: args.stale_seconds,
            backend_timeout: Duration::from_millis(args.backend_timeout_ms.max(1)),
            idle_worker_timeout: Duration::from_secs(args.idle_worker_seconds.max(1)),
            max_message_bytes: args.max_message_bytes,
            log_dir: resolve_log_dir(&args.log_dir),
        }
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_value("TRELLIS_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn resolve_session_store(flag: Option<SessionStoreKind>) -> SessionStoreKind {
    if let Some(kind) = flag {
        return kind;
    }
    env_value("TRELLIS_SESSION_STORE")
        .and_then(|value| parse_store_kind(&value))
        .unwrap_or(SessionStoreKind::Memory)
}

fn parse_store_kind(value: &str) -> Option<SessionStoreKind> {
    match value.trim().to_lowercase().as_str() {
        "memory" | "mem" => Some(SessionStoreKind::Memory),
        "sqlite" | "file" => Some(SessionStoreKind::Sqlite),
        _ => None,
    }
}

fn resolve_session_db(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    env_value("TRELLIS_SESSION_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".trellis/sessions.db"))
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value("TRELLIS_LOG_DIR").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_take_precedence() {
        let args = Args::parse_from([
            "trellis-hub",
            "--addr",
            "127.0.0.1:9100",
            "--session-store",
            "sqlite",
            "--session-db",
            "/tmp/trellis-test.db",
            "--session-ttl",
            "60",
            "--log-dir",
            "/tmp/trellis-logs",
        ]);
        let config = Config::from_args(args);
        assert_eq!(config.addr, "127.0.0.1:9100");
        assert_eq!(config.session_store, SessionStoreKind::Sqlite);
        assert_eq!(config.session_db, PathBuf::from("/tmp/trellis-test.db"));
        assert_eq!(config.session_ttl_chrono(), chrono::Duration::seconds(60));
        assert_eq!(config.log_dir, "/tmp/trellis-logs");
    }

    #[test]
    fn defaults_cover_timeouts() {
        let args = Args::parse_from(["trellis-hub", "--addr", "127.0.0.1:1"]);
        let config = Config::from_args(args);
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.backend_timeout, Duration::from_millis(2000));
        assert_eq!(config.max_message_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn store_kind_parsing_is_lenient() {
        assert_eq!(parse_store_kind(" SQLite "), Some(SessionStoreKind::Sqlite));
        assert_eq!(parse_store_kind("mem"), Some(SessionStoreKind::Memory));
        assert_eq!(parse_store_kind("redis"), None);
    }
}
