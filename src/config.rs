//! Strongly-typed configuration for the bot.
//!
//! Values come from three places, in increasing priority: compiled-in
//! defaults, a `.env` file, and real environment variables. The tracked
//! appointment requests themselves live in a separate JSON file so they can
//! be edited without touching the environment.

use std::env;
use std::fs;
use std::num::{ParseFloatError, ParseIntError};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AppointmentInfo;

/// Landing page of the booking wizard.
pub const DEFAULT_NEW_APPOINTMENT_URL: &str =
    "http://www.valencia.es/QSIGE/apps/citaprevia/index.html#!/newAppointment/";
/// Landing page of the existing-appointments query.
pub const DEFAULT_QUERY_APPOINTMENT_URL: &str =
    "http://www.valencia.es/QSIGE/apps/citaprevia/index.html#!/queryAppoinment";

/// Retry pacing for a failed per-entry pass.
///
/// The delay grows geometrically per consecutive failure and resets on the
/// first clean pass, so a portal outage does not turn into a tight reload
/// loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_secs: 5,
            multiplier: 2.0,
            max_delay_secs: 300,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay_secs as f64;
        let max = self.max_delay_secs as f64;
        let scaled = initial * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(max).max(0.0))
    }
}

/// One tracked request loaded from the entries file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntry {
    #[serde(flatten)]
    pub appointment: AppointmentInfo,
    /// Exclusive deadline: only slots strictly before this date are taken.
    #[serde(rename = "beforeDate")]
    pub before_date: NaiveDate,
}

/// Configuration values for the bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub new_appointment_url: String,
    pub query_appointment_url: String,
    /// Idle delay between clean polling passes.
    pub poll_delay: Duration,
    /// Quiet period before the first dialog probe after an action.
    pub dialog_pre_delay: Duration,
    /// Pause between dialog probes while loading dialogs keep appearing.
    pub dialog_poll_interval: Duration,
    /// Consecutive empty probes required to call the page settled.
    pub dialog_max_empty_polls: u32,
    pub backoff: BackoffPolicy,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub entries_path: PathBuf,
    pub telegram_bot_token: Option<String>,
    pub telegram_subscribers_path: PathBuf,
    pub log_file: Option<PathBuf>,
    pub log_max_file_bytes: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            new_appointment_url: DEFAULT_NEW_APPOINTMENT_URL.to_string(),
            query_appointment_url: DEFAULT_QUERY_APPOINTMENT_URL.to_string(),
            poll_delay: Duration::from_secs(5),
            dialog_pre_delay: Duration::from_millis(500),
            dialog_poll_interval: Duration::from_millis(250),
            dialog_max_empty_polls: 4,
            backoff: BackoffPolicy::default(),
            headless: false,
            chrome_executable: None,
            entries_path: PathBuf::from("entries.json"),
            telegram_bot_token: None,
            telegram_subscribers_path: PathBuf::from("subscribers.txt"),
            log_file: Some(PathBuf::from("citabot.log")),
            log_max_file_bytes: 5 * 1024 * 1024,
        }
    }
}

impl BotConfig {
    /// Construct a configuration from environment variables, after loading a
    /// `.env` file if present.
    pub fn from_env() -> Result<Self, BotConfigError> {
        let _ = dotenv();
        let mut config = BotConfig::default();

        if let Some(value) = env_var("CITABOT_NEW_APPOINTMENT_URL") {
            config.new_appointment_url = value;
        }
        if let Some(value) = env_var("CITABOT_QUERY_APPOINTMENT_URL") {
            config.query_appointment_url = value;
        }
        if let Some(value) = env_var("CITABOT_POLL_DELAY_SECS") {
            config.poll_delay = Duration::from_secs(parse_u64("CITABOT_POLL_DELAY_SECS", &value)?);
        }
        if let Some(value) = env_var("CITABOT_DIALOG_PRE_DELAY_MS") {
            config.dialog_pre_delay =
                Duration::from_millis(parse_u64("CITABOT_DIALOG_PRE_DELAY_MS", &value)?);
        }
        if let Some(value) = env_var("CITABOT_DIALOG_POLL_INTERVAL_MS") {
            config.dialog_poll_interval =
                Duration::from_millis(parse_u64("CITABOT_DIALOG_POLL_INTERVAL_MS", &value)?);
        }
        if let Some(value) = env_var("CITABOT_DIALOG_MAX_EMPTY_POLLS") {
            config.dialog_max_empty_polls =
                parse_u64("CITABOT_DIALOG_MAX_EMPTY_POLLS", &value)? as u32;
        }
        if let Some(value) = env_var("CITABOT_BACKOFF_INITIAL_SECS") {
            config.backoff.initial_delay_secs = parse_u64("CITABOT_BACKOFF_INITIAL_SECS", &value)?;
        }
        if let Some(value) = env_var("CITABOT_BACKOFF_MULTIPLIER") {
            config.backoff.multiplier = parse_f64("CITABOT_BACKOFF_MULTIPLIER", &value)?;
        }
        if let Some(value) = env_var("CITABOT_BACKOFF_MAX_SECS") {
            config.backoff.max_delay_secs = parse_u64("CITABOT_BACKOFF_MAX_SECS", &value)?;
        }
        if let Some(value) = env_var("CITABOT_HEADLESS") {
            config.headless = parse_bool("CITABOT_HEADLESS", &value)?;
        }
        if let Some(value) = env_var("CITABOT_CHROME_EXECUTABLE") {
            config.chrome_executable = Some(PathBuf::from(value));
        }
        if let Some(value) = env_var("CITABOT_ENTRIES_FILE") {
            config.entries_path = PathBuf::from(value);
        }
        if let Some(value) = env_var("CITABOT_TELEGRAM_BOT_TOKEN") {
            config.telegram_bot_token = Some(value);
        }
        if let Some(value) = env_var("CITABOT_TELEGRAM_SUBSCRIBERS_FILE") {
            config.telegram_subscribers_path = PathBuf::from(value);
        }
        if let Some(value) = env_var("CITABOT_LOG_FILE") {
            config.log_file = match value.as_str() {
                "none" | "off" => None,
                _ => Some(PathBuf::from(value)),
            };
        }
        if let Some(value) = env_var("CITABOT_LOG_MAX_BYTES") {
            config.log_max_file_bytes = parse_u64("CITABOT_LOG_MAX_BYTES", &value)?;
        }

        Ok(config)
    }

    /// Load the tracked requests from the configured JSON file.
    pub fn load_entries(&self) -> Result<Vec<TrackedEntry>, BotConfigError> {
        load_entries(&self.entries_path)
    }
}

/// Parse a tracked-entries JSON file.
pub fn load_entries(path: &Path) -> Result<Vec<TrackedEntry>, BotConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| BotConfigError::EntriesIo {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: Vec<TrackedEntry> =
        serde_json::from_str(&raw).map_err(|source| BotConfigError::EntriesJson {
            path: path.to_path_buf(),
            source,
        })?;
    if entries.is_empty() {
        return Err(BotConfigError::NoEntries {
            path: path.to_path_buf(),
        });
    }
    Ok(entries)
}

/// Errors that can arise while constructing a [`BotConfig`].
#[derive(Debug, Error)]
pub enum BotConfigError {
    #[error("invalid boolean '{value}' for {field}")]
    InvalidBool { field: &'static str, value: String },
    #[error("invalid number '{value}' for {field}: {source}")]
    InvalidNumber {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid number '{value}' for {field}: {source}")]
    InvalidFloat {
        field: &'static str,
        value: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("cannot read entries file {path}: {source}")]
    EntriesIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in entries file {path}: {source}")]
    EntriesJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("entries file {path} contains no entries")]
    NoEntries { path: PathBuf },
}

fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, BotConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BotConfigError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, BotConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|source| BotConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_f64(field: &'static str, value: &str) -> Result<f64, BotConfigError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|source| BotConfigError::InvalidFloat {
            field,
            value: value.to_string(),
            source,
        })
}
