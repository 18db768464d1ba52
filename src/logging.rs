//! Subscriber setup for the server binary and `ragctl`.
//!
//! Console output always goes to stderr. `ragctl` prints answers and JSON on stdout, so keeping
//! log lines off that stream lets its output be piped straight into other tools. The server also
//! mirrors every event into a plain-text file, `logs/rusty-rag.log` unless `RUSTY_RAG_LOG_FILE`
//! names another path. The file is written from a background worker.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable overriding the server log file.
pub const LOG_FILE_ENV: &str = "RUSTY_RAG_LOG_FILE";
const DEFAULT_LOG_FILE: &str = "logs/rusty-rag.log";

// Dropping the guard would stop the background writer and lose buffered lines.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Which binary is installing the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Long-running HTTP server: stderr plus the log file.
    Server,
    /// One-shot `ragctl` command: stderr only.
    Cli,
}

/// Install the global subscriber. `RUST_LOG` filters both outputs and defaults to `info`.
///
/// A second call is a no-op.
pub fn init_tracing(target: LogTarget) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let file = match target {
        LogTarget::Server => {
            file_writer(&log_file_path(std::env::var(LOG_FILE_ENV).ok())).map(|writer| {
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .compact()
            })
        }
        LogTarget::Cli => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
}

fn log_file_path(configured: Option<String>) -> PathBuf {
    configured
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
}

/// Open `path` for appending, creating its parent directory. Failures are reported on stderr
/// and leave the server logging to the console only.
fn file_writer(path: &Path) -> Option<NonBlocking> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("Cannot create log directory {}: {err}", parent.display());
            return None;
        }
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let _ = FILE_GUARD.set(guard);
            Some(writer)
        }
        Err(err) => {
            eprintln!("Cannot open log file {}: {err}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_override_falls_back_to_the_default_file() {
        assert_eq!(log_file_path(None), PathBuf::from(DEFAULT_LOG_FILE));
        assert_eq!(log_file_path(Some("  ".into())), PathBuf::from(DEFAULT_LOG_FILE));
        assert_eq!(
            log_file_path(Some("/var/log/rag.log".into())),
            PathBuf::from("/var/log/rag.log")
        );
    }

    #[test]
    fn file_writer_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/deeper/server.log");
        assert!(file_writer(&path).is_some());
        assert!(path.exists());
    }
}
