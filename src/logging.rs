//! Tracing setup for the pipeline and its developer tools.
//!
//! Every launch gets its own `mregion_<timestamp>.log` under the app logs
//! directory, mirrored to the console. Only the newest few launch logs are
//! kept.

use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use time::{OffsetDateTime, UtcOffset, format_description::FormatItem, macros::format_description};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::app_dirs::{self, AppDirError};

/// Launch logs retained by default.
pub const DEFAULT_KEEP_FILES: usize = 10;
const LOG_FILE_PREFIX: &str = "mregion_";
const LOG_FILE_EXTENSION: &str = ".log";
const DEFAULT_FILTER: &str = "info";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Cannot resolve the log directory: {0}")]
    AppDir(#[from] AppDirError),
    #[error("Failed to prepare log directory {path}: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("Failed to create log file {path}: {source}")]
    CreateFile { path: PathBuf, source: io::Error },
    #[error("Failed to prune old log {path}: {source}")]
    Prune { path: PathBuf, source: io::Error },
    #[error("Failed to format log file timestamp: {0}")]
    FormatTime(#[from] time::error::Format),
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Where console output goes, besides the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Console {
    #[default]
    Stdout,
    /// For tools that print their own results on stdout.
    Stderr,
    Off,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Defaults to `<app root>/logs`.
    pub directory: Option<PathBuf>,
    pub console: Console,
    pub keep_files: usize,
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            directory: None,
            console: Console::Stdout,
            keep_files: DEFAULT_KEEP_FILES,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Initialize logging with the default options.
pub fn init() -> Result<PathBuf, LoggingError> {
    init_with(LogOptions::default())
}

/// Install the global subscriber and return this launch's log file.
///
/// Later calls are no-ops that return the first launch's file. Errors are
/// returned so callers can keep running without logs.
pub fn init_with(options: LogOptions) -> Result<PathBuf, LoggingError> {
    static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
    if let (Some(_), Some(path)) = (LOG_GUARD.get(), LOG_PATH.get()) {
        return Ok(path.clone());
    }

    let log_dir = match options.directory {
        Some(dir) => {
            fs::create_dir_all(&dir).map_err(|source| LoggingError::Directory {
                path: dir.clone(),
                source,
            })?;
            dir
        }
        None => app_dirs::logs_dir()?,
    };
    let file_name = launch_file_name(now_local_or_utc())?;
    let log_path = log_dir.join(&file_name);
    touch(&log_path)?;
    prune_launch_logs(&log_dir, options.keep_files.max(1))?;

    let (file_writer, guard) = tracing_appender::non_blocking(rolling::never(&log_dir, &file_name));
    let timer = local_timer();
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_timer(timer.clone())
        .with_writer(file_writer);
    let console_layer = match options.console {
        Console::Stdout => Some(
            fmt::layer()
                .with_timer(timer.clone())
                .with_writer(io::stdout)
                .boxed(),
        ),
        Console::Stderr => Some(
            fmt::layer()
                .with_timer(timer)
                .with_writer(io::stderr)
                .boxed(),
        ),
        Console::Off => None,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let subscriber = Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = LOG_GUARD.set(guard);
    let _ = LOG_PATH.set(log_path.clone());

    tracing::info!("Logging to {}", log_path.display());
    Ok(log_path)
}

fn touch(path: &Path) -> Result<(), LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|_| ())
        .map_err(|source| LoggingError::CreateFile {
            path: path.to_path_buf(),
            source,
        })
}

fn is_launch_log(name: &str) -> bool {
    name.starts_with(LOG_FILE_PREFIX) && name.ends_with(LOG_FILE_EXTENSION)
}

/// Launch log names embed a zero-padded timestamp, so name order is age order.
fn prune_launch_logs(dir: &Path, keep: usize) -> Result<(), LoggingError> {
    let entries = fs::read_dir(dir).map_err(|source| LoggingError::Directory {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut logs: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            is_launch_log(&name).then(|| (name, entry.path()))
        })
        .collect();
    logs.sort();
    let excess = logs.len().saturating_sub(keep);
    for (_, path) in logs.into_iter().take(excess) {
        fs::remove_file(&path).map_err(|source| LoggingError::Prune { path, source })?;
    }
    Ok(())
}

fn launch_file_name(now: OffsetDateTime) -> Result<String, LoggingError> {
    const NAME_FORMAT: &[FormatItem<'_>] =
        format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    Ok(format!(
        "{LOG_FILE_PREFIX}{}{LOG_FILE_EXTENSION}",
        now.format(NAME_FORMAT)?
    ))
}

fn local_timer() -> fmt::time::OffsetTime<time::format_description::BorrowedFormatItem<'static>> {
    const LINE_FORMAT: &[FormatItem<'static>] =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    fmt::time::OffsetTime::new(offset, LINE_FORMAT.into())
}

fn now_local_or_utc() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn launch_file_name_embeds_timestamp() {
        let fixed = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(
            launch_file_name(fixed).unwrap(),
            "mregion_2023-11-14_22-13-20.log"
        );
    }

    #[test]
    fn pruning_drops_oldest_launch_logs_only() {
        let dir = tempdir().unwrap();
        for day in 1..=12 {
            touch(&dir.path().join(format!("mregion_2024-01-{day:02}_08-00-00.log"))).unwrap();
        }
        touch(&dir.path().join("notes.txt")).unwrap();
        touch(&dir.path().join("other_2020-01-01.log")).unwrap();

        prune_launch_logs(dir.path(), 10).unwrap();
        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), 12);
        assert!(remaining.contains(&"notes.txt".to_string()));
        assert!(remaining.contains(&"other_2020-01-01.log".to_string()));
        assert!(!remaining.contains(&"mregion_2024-01-01_08-00-00.log".to_string()));
        assert!(!remaining.contains(&"mregion_2024-01-02_08-00-00.log".to_string()));
        assert!(remaining.contains(&"mregion_2024-01-12_08-00-00.log".to_string()));
    }
}
