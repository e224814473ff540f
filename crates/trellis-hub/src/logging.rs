//! Process-wide tracing setup: stdout always, plus an append-only file
//! when a log directory is configured.

use crate::config::Config;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FILE_NAME: &str = "trellis-hub.log";

/// `RUST_LOG` wins, then `--debug`, then `TRELLIS_LOG_LEVEL`, then `info`.
fn log_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if debug {
            "debug".to_string()
        } else {
            std::env::var("TRELLIS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
        };
        EnvFilter::new(level)
    })
}

/// Installs the global subscriber. Returns the log file path when file
/// output is active.
pub fn init_logging(config: &Config) -> Option<PathBuf> {
    let file = open_log_file(&config.log_dir).unwrap_or_else(|err| {
        eprintln!("trellis-hub: file logging disabled: {err}");
        None
    });
    let path = file.as_ref().map(|(path, _)| path.clone());
    let file_layer = file.map(|(_, file)| file_layer(file));

    tracing_subscriber::registry()
        .with(log_filter(config.debug))
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .ok()?;
    path
}

fn file_layer<S>(file: File) -> fmt::Layer<S, fmt::format::DefaultFields, fmt::format::Format, Mutex<File>> {
    fmt::layer().with_ansi(false).with_writer(Mutex::new(file))
}

fn open_log_file(log_dir: &str) -> io::Result<Option<(PathBuf, File)>> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir);
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((path, file)))
}
