//! Leveled logging on top of the `log` facade.
//!
//! Six severities are recognised in configuration, `TRACE` through `FATAL`.
//! `log` has no fatal level, so fatal records are emitted at error level
//! under the [`FATAL_TARGET`] target with a `Fatal:` prefix by
//! [`log_fatal`]. At level FATAL only those records are written. Records go to stderr and/or an
//! append-mode log file; file lines are timestamped.

use crate::config::{expand_home, ConfigError, LoggingConfig};
use chrono::Local;
use log::{Level, LevelFilter};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

/// Log target carrying fatal records.
pub const FATAL_TARGET: &str = "fatal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" => Ok(LogLevel::Fatal),
            _ => Err(s.to_string()),
        }
    }
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::Error,
        }
    }
}

/// Writes each formatted record to stderr and/or a log file.
pub struct LogSink {
    stderr: bool,
    file: Option<File>,
}

impl LogSink {
    pub fn new(stderr: bool, file: Option<File>) -> Self {
        Self { stderr, file }
    }

    pub fn open(config: &LoggingConfig) -> Result<Self, ConfigError> {
        let file = match &config.file {
            Some(path) => Some(open_log_file(&expand_home(path))?),
            None => None,
        };
        Ok(Self::new(config.stderr, file))
    }
}

fn open_log_file(path: &Path) -> Result<File, ConfigError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ConfigError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr {
            io::stderr().write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            let stamp = Local::now().format("%d %b %Y %H:%M:%S");
            write!(file, "{stamp} ")?;
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr {
            io::stderr().flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Installs the global logger according to `config`.
pub fn init(config: &LoggingConfig) -> Result<(), ConfigError> {
    let level = config.level()?;
    let sink = LogSink::open(config)?;
    install(level, sink);
    Ok(())
}

/// Logger used when the configuration itself could not be loaded.
pub fn init_fallback() {
    install(LogLevel::Warn, LogSink::new(true, None));
}

fn install(level: LogLevel, sink: LogSink) {
    if let Err(e) = builder(level, sink).try_init() {
        eprintln!("logger already initialised: {e}");
    }
}

fn builder(level: LogLevel, sink: LogSink) -> env_logger::Builder {
    let mut builder = env_logger::Builder::from_default_env();
    match level {
        LogLevel::Fatal => builder
            .filter_level(LevelFilter::Off)
            .filter_module(FATAL_TARGET, LevelFilter::Error),
        _ => builder.filter_level(level.to_level_filter()),
    };
    builder
        .format(|buf, record| {
            if record.level() == Level::Trace {
                let file = record
                    .file()
                    .and_then(|f| Path::new(f).file_name())
                    .and_then(|f| f.to_str())
                    .unwrap_or("?");
                writeln!(
                    buf,
                    "{}() [{}:{}] {}",
                    record.module_path().unwrap_or_default(),
                    file,
                    record.line().unwrap_or(0),
                    record.args()
                )
            } else {
                writeln!(buf, "{}", record.args())
            }
        })
        .target(env_logger::Target::Pipe(Box::new(sink)));
    builder
}

/// Logs `err` and its causes at fatal severity.
pub fn log_fatal(context: &str, err: &dyn std::error::Error) {
    log::error!(target: FATAL_TARGET, "Fatal:  {context} ({err})");
    let mut source = err.source();
    while let Some(cause) = source {
        log::error!(target: FATAL_TARGET, "Fatal:    caused by: {cause}");
        source = cause.source();
    }
}
