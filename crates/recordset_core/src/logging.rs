//! Logging bootstrap for hosts embedding the record layer.
//!
//! # Responsibility
//! - Start one size-rotated file logger per process.
//! - Route record-layer events through dedicated targets so hosts can tune
//!   them apart: per-statement storage tracing is off unless requested.
//!
//! # Invariants
//! - Log lines are metadata-only: models, fields, ids, counts, durations.
//! - Initialization never panics; a conflicting second configuration is
//!   rejected and the active one stays in place.

use flexi_logger::{
    Cleanup, Criterion, FileSpec, LogSpecification, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One line per storage round trip (`event=sql`).
pub const STORAGE_TARGET: &str = "recordset::storage";
/// Create, write, unlink, load and aggregate events.
pub const COLLECTION_TARGET: &str = "recordset::collection";
/// Relation synchronization warnings.
pub const RELATION_TARGET: &str = "recordset::relation";

const LOG_FILE_BASENAME: &str = "recordset";
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const KEPT_LOG_FILES: usize = 5;
const PANIC_PAYLOAD_LIMIT: usize = 160;

static ACTIVE: OnceCell<ActiveLogger> = OnceCell::new();
static PANIC_HOOK: OnceCell<()> = OnceCell::new();

/// Requested logger setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    level: LevelFilter,
    log_dir: PathBuf,
    sql_statements: bool,
}

impl LoggingConfig {
    /// Parses `level` (`trace`..`error`, `warning` accepted) and checks that
    /// `log_dir` is absolute.
    pub fn new(level: &str, log_dir: &str) -> Result<Self, String> {
        Ok(Self {
            level: parse_level(level)?,
            log_dir: absolute_dir(log_dir)?,
            sql_statements: false,
        })
    }

    /// Logs every storage statement at `debug`, whatever the base level.
    pub fn sql_statements(mut self, enabled: bool) -> Self {
        self.sql_statements = enabled;
        self
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Base level for every target; storage capped at `info` unless
    /// statement tracing is on.
    pub fn specification(&self) -> LogSpecification {
        let storage = if self.sql_statements {
            LevelFilter::Debug.max(self.level)
        } else {
            self.level.min(LevelFilter::Info)
        };
        LogSpecification::builder()
            .default(self.level)
            .module(STORAGE_TARGET, storage)
            .build()
    }
}

/// Active logger, as reported by [`logging_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingStatus {
    pub level: LevelFilter,
    pub log_dir: PathBuf,
    pub sql_statements: bool,
}

struct ActiveLogger {
    config: LoggingConfig,
    _handle: LoggerHandle,
}

/// Starts file logging at `level` in `log_dir`, statement tracing off.
///
/// Idempotent for the same arguments.
///
/// # Errors
/// Unsupported level, relative or empty directory, a directory that cannot
/// be created, a backend failure, or a different configuration already
/// active.
pub fn init_logging(level: &str, log_dir: &str) -> Result<(), String> {
    init_logging_with(LoggingConfig::new(level, log_dir)?)
}

/// Starts file logging with an explicit [`LoggingConfig`].
pub fn init_logging_with(config: LoggingConfig) -> Result<(), String> {
    let active = ACTIVE.get_or_try_init(|| start(config.clone()))?;
    if active.config != config {
        return Err(format!(
            "logging already active with level `{}` in `{}` (sql_statements={}); refusing {:?}",
            active.config.level,
            active.config.log_dir.display(),
            active.config.sql_statements,
            config
        ));
    }
    Ok(())
}

/// Active logger settings, `None` before initialization.
pub fn logging_status() -> Option<LoggingStatus> {
    ACTIVE.get().map(|active| LoggingStatus {
        level: active.config.level,
        log_dir: active.config.log_dir.clone(),
        sql_statements: active.config.sql_statements,
    })
}

/// `debug` in debug builds, `info` in release builds.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn start(config: LoggingConfig) -> Result<ActiveLogger, String> {
    std::fs::create_dir_all(&config.log_dir).map_err(|err| {
        format!(
            "cannot create log directory `{}`: {err}",
            config.log_dir.display()
        )
    })?;
    let handle = Logger::with(config.specification())
        .log_to_file(
            FileSpec::default()
                .directory(config.log_dir.as_path())
                .basename(LOG_FILE_BASENAME),
        )
        .rotate(
            Criterion::Size(ROTATE_AT_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEPT_LOG_FILES),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(|err| format!("cannot start logger: {err}"))?;

    if PANIC_HOOK.set(()).is_ok() {
        install_panic_hook();
    }
    info!(
        "event=logging_init module=logging status=ok level={} sql_statements={} version={}",
        config.level,
        config.sql_statements,
        env!("CARGO_PKG_VERSION")
    );
    Ok(ActiveLogger {
        config,
        _handle: handle,
    })
}

fn parse_level(level: &str) -> Result<LevelFilter, String> {
    let trimmed = level.trim();
    let name = if trimmed.eq_ignore_ascii_case("warning") {
        "warn"
    } else {
        trimmed
    };
    match LevelFilter::from_str(name) {
        Ok(LevelFilter::Off) | Err(_) => Err(format!(
            "unsupported log level `{trimmed}`; expected trace|debug|info|warn|error"
        )),
        Ok(parsed) => Ok(parsed),
    }
}

fn absolute_dir(log_dir: &str) -> Result<PathBuf, String> {
    let path = Path::new(log_dir.trim());
    if path.as_os_str().is_empty() {
        return Err("log_dir cannot be empty".to_string());
    }
    if !path.is_absolute() {
        return Err(format!(
            "log_dir must be absolute, got `{}`",
            path.display()
        ));
    }
    Ok(path.to_path_buf())
}

fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        // Panic payloads may quote record values.
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let location = info
            .location()
            .map_or_else(|| "unknown".to_string(), |at| format!("{}:{}", at.file(), at.line()));
        error!(
            "event=panic module=logging status=error location={location} payload={}",
            one_line(&payload, PANIC_PAYLOAD_LIMIT)
        );
        previous(info);
    }));
}

/// Flattens `text` to one line of at most `limit` characters.
fn one_line(text: &str, limit: usize) -> String {
    let mut line: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .take(limit)
        .collect();
    if text.chars().count() > limit {
        line.push_str("...");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::{
        init_logging, init_logging_with, logging_status, one_line, parse_level, LoggingConfig,
        STORAGE_TARGET,
    };
    use log::LevelFilter;

    fn storage_level(config: &LoggingConfig) -> Option<LevelFilter> {
        config
            .specification()
            .module_filters()
            .iter()
            .find(|filter| filter.module_name.as_deref() == Some(STORAGE_TARGET))
            .map(|filter| filter.level_filter)
    }

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_level(" INFO "), Ok(LevelFilter::Info));
        assert_eq!(parse_level("Warning"), Ok(LevelFilter::Warn));
        assert!(parse_level("off").is_err());
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn relative_directories_are_rejected() {
        let err = LoggingConfig::new("info", "logs/dev").unwrap_err();
        assert!(err.contains("absolute"));
        assert!(LoggingConfig::new("info", "  ").is_err());
    }

    #[test]
    fn statement_tracing_is_opt_in() {
        let dir = std::env::temp_dir();
        let dir = dir.to_str().unwrap();

        let quiet = LoggingConfig::new("debug", dir).unwrap();
        assert_eq!(storage_level(&quiet), Some(LevelFilter::Info));

        let traced = LoggingConfig::new("info", dir).unwrap().sql_statements(true);
        assert_eq!(storage_level(&traced), Some(LevelFilter::Debug));

        let strict = LoggingConfig::new("error", dir).unwrap();
        assert_eq!(storage_level(&strict), Some(LevelFilter::Error));
    }

    #[test]
    fn panic_payloads_are_flattened_and_capped() {
        assert_eq!(one_line("a\nb\rc", 10), "a b c");
        assert_eq!(one_line("abcdef", 3), "abc...");
    }

    #[test]
    fn init_is_idempotent_and_rejects_other_configs() {
        let dir = std::env::temp_dir().join(format!("recordset-logging-{}", std::process::id()));
        let path = dir.to_str().unwrap().to_string();
        let other = dir.join("other");

        init_logging("info", &path).unwrap();
        init_logging("info", &path).unwrap();
        assert!(init_logging("debug", &path)
            .unwrap_err()
            .contains("refusing"));
        assert!(init_logging("info", other.to_str().unwrap()).is_err());
        let traced = LoggingConfig::new("info", &path).unwrap().sql_statements(true);
        assert!(init_logging_with(traced).is_err());

        let status = logging_status().unwrap();
        assert_eq!(status.level, LevelFilter::Info);
        assert_eq!(status.log_dir, dir);
        assert!(!status.sql_statements);
    }
}
