//! Structured logging for the bot.
//!
//! Long unattended runs need two sinks: the console for interactive use and
//! a size-rotated file for post-mortems. [`BotLogger`] owns both and also
//! forwards every record to the `log` facade so library consumers keep
//! their usual filtering.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Callback signature for an external record sink.
pub type LogCallback = Arc<dyn Fn(&BotLogRecord) + Send + Sync + 'static>;

/// Log severity, ordered from most to least urgent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// One structured log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotLogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
}

impl BotLogRecord {
    pub fn new(level: LogLevel, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category: category.into(),
            message: message.into(),
        }
    }

    fn render(&self) -> String {
        format!(
            "[{}] {:<5} [{}] {}",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.level.label(),
            self.category,
            self.message
        )
    }
}

/// Sink configuration for [`BotLogger`].
#[derive(Clone)]
pub struct LogConfig {
    pub max_level: LogLevel,
    pub console: bool,
    /// Path of the rotating log file, `None` for console-only logging.
    pub file_path: Option<PathBuf>,
    /// Rotate the file once it grows past this many bytes.
    pub max_file_bytes: u64,
    pub external: Option<LogCallback>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_level: LogLevel::Info,
            console: true,
            file_path: None,
            max_file_bytes: 5 * 1024 * 1024,
            external: None,
        }
    }
}

/// Logger shared across the bot's layers.
pub struct BotLogger {
    config: LogConfig,
    file: Mutex<Option<File>>,
}

impl fmt::Debug for BotLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotLogger")
            .field("max_level", &self.config.max_level)
            .field("console", &self.config.console)
            .field("file_path", &self.config.file_path)
            .field("external", &self.config.external.is_some())
            .finish()
    }
}

impl BotLogger {
    pub fn with_config(config: LogConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            file: Mutex::new(None),
        })
    }

    pub fn new(max_level: LogLevel) -> Arc<Self> {
        Self::with_config(LogConfig {
            max_level,
            ..LogConfig::default()
        })
    }

    /// A logger that drops everything. Used in tests.
    pub fn disabled() -> Arc<Self> {
        Self::with_config(LogConfig {
            max_level: LogLevel::Error,
            console: false,
            file_path: None,
            ..LogConfig::default()
        })
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn log(&self, level: LogLevel, category: &str, message: impl Into<String>) {
        if level > self.config.max_level {
            return;
        }
        let record = BotLogRecord::new(level, category, message);
        let line = record.render();

        match record.level {
            LogLevel::Error => {
                log::error!(target: "citabot", "[{}] {}", record.category, record.message)
            }
            LogLevel::Warn => {
                log::warn!(target: "citabot", "[{}] {}", record.category, record.message)
            }
            LogLevel::Info => {
                log::info!(target: "citabot", "[{}] {}", record.category, record.message)
            }
            LogLevel::Debug => {
                log::debug!(target: "citabot", "[{}] {}", record.category, record.message)
            }
        }

        if self.config.console {
            println!("{line}");
        }
        if self.config.file_path.is_some() {
            self.write_file_line(&line);
        }
        if let Some(external) = &self.config.external {
            external(&record);
        }
    }

    pub fn error(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, category, message);
    }

    pub fn warn(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, category, message);
    }

    pub fn info(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, category, message);
    }

    pub fn debug(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, category, message);
    }

    fn write_file_line(&self, line: &str) {
        let Some(path) = &self.config.file_path else {
            return;
        };
        let Ok(mut slot) = self.file.lock() else {
            return;
        };
        // Logging must never take the bot down; file errors drop the line.
        if slot.is_none() {
            *slot = OpenOptions::new().create(true).append(true).open(path).ok();
        }
        let over_limit = slot
            .as_ref()
            .and_then(|file| file.metadata().ok())
            .map(|meta| meta.len() >= self.config.max_file_bytes)
            .unwrap_or(false);
        if over_limit {
            *slot = None;
            let _ = fs::rename(path, path.with_extension("old"));
            *slot = OpenOptions::new().create(true).append(true).open(path).ok();
        }
        if let Some(file) = slot.as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }
}
