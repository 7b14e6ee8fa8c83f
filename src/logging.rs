//! Process-wide logger setup on top of `env_logger`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use env_logger::{Builder, Target};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("a logger is already installed")]
    AlreadyInitialized(#[from] log::SetLoggerError),

    #[error("unknown log level {0:?}")]
    UnknownLevel(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    /// Reported as `error`; `log` has no higher level.
    Critical,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Error | LogLevel::Critical => LevelFilter::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            _ => Err(LoggingError::UnknownLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerOptions {
    pub level: LogLevel,
    pub console: bool,
    /// Appended to when set.
    pub file: Option<PathBuf>,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: true,
            file: None,
        }
    }
}

/// Fans every record out to stderr and the log file.
struct TeeWriter {
    console: bool,
    file: Option<File>,
}

impl TeeWriter {
    fn new(console: bool, file: Option<&Path>) -> Result<Self, LoggingError> {
        let file = file
            .map(|path| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| LoggingError::LogFile {
                        path: path.to_path_buf(),
                        source,
                    })
            })
            .transpose()?;
        Ok(Self { console, file })
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.console {
            io::stderr().write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.console {
            io::stderr().flush()?;
        }
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Installs the global logger. `RUST_LOG` takes precedence over
/// `options.level`.
pub fn init(options: &LoggerOptions) -> Result<(), LoggingError> {
    let writer = TeeWriter::new(options.console, options.file.as_deref())?;
    Builder::new()
        .filter_level(options.level.into())
        .parse_default_env()
        .format_timestamp_secs()
        .target(Target::Pipe(Box::new(writer)))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_onto_filters() {
        assert_eq!(LevelFilter::from(LogLevel::Warning), LevelFilter::Warn);
        assert_eq!(LevelFilter::from(LogLevel::Critical), LevelFilter::Error);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert!(LogLevel::Debug < LogLevel::Critical);
    }

    #[test]
    fn tee_appends_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medimg.log");
        std::fs::write(&path, "first\n").unwrap();

        let mut writer = TeeWriter::new(false, Some(&path)).unwrap();
        writer.write_all(b"second\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn unwritable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result = TeeWriter::new(true, Some(&dir.path().join("missing/medimg.log")));
        assert!(matches!(result, Err(LoggingError::LogFile { .. })));
    }

    #[test]
    fn second_init_fails() {
        let options = LoggerOptions {
            console: false,
            ..LoggerOptions::default()
        };
        let _ = init(&options);
        assert!(matches!(
            init(&options),
            Err(LoggingError::AlreadyInitialized(_))
        ));
    }
}
