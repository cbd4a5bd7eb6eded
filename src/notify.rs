//! Outbound notifications.
//!
//! The scheduler only talks to the [`Notifier`] trait; the production
//! implementation is a small Telegram bot that broadcasts to a flat file of
//! chat ids and auto-subscribes anyone who messages it. Delivery is best
//! effort: a failed send is logged and never fails a scheduling cycle.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::logging::BotLogger;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("cannot access subscribers file {path}: {source}")]
    Subscribers {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sink for scheduling-cycle outcomes.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn broadcast(&self, message: &str);
}

/// Notifier that drops everything.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn broadcast(&self, _message: &str) {}
}

/// Live tracking state, queried when a new subscriber joins.
pub trait StatusSource: Send + Sync {
    /// One human-readable line per tracked request.
    fn status_lines(&self) -> Vec<String>;
}

/// Status source reporting nothing, for tests and headless runs.
pub struct EmptyStatus;

impl StatusSource for EmptyStatus {
    fn status_lines(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

/// Telegram bot broadcasting to a persisted subscriber list.
pub struct TelegramNotifier {
    client: reqwest::Client,
    token: String,
    subscribers_path: PathBuf,
    subscribers: Mutex<HashSet<i64>>,
    logger: Arc<BotLogger>,
}

impl TelegramNotifier {
    pub fn new(
        token: impl Into<String>,
        subscribers_path: impl Into<PathBuf>,
        logger: Arc<BotLogger>,
    ) -> Result<Self, NotifyError> {
        let subscribers_path = subscribers_path.into();
        let subscribers = load_subscribers(&subscribers_path)?;
        logger.info(
            "notify",
            format!("telegram notifier ready, {} subscriber(s)", subscribers.len()),
        );
        Ok(Self {
            client: reqwest::Client::new(),
            token: token.into(),
            subscribers_path,
            subscribers: Mutex::new(subscribers),
            logger,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.token)
    }

    fn subscriber_ids(&self) -> Vec<i64> {
        let subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.iter().copied().collect()
    }

    /// Record a new subscriber, appending it to the flat file. Returns
    /// whether the id was new.
    fn add_subscriber(&self, id: i64) -> Result<bool, NotifyError> {
        let added = {
            let mut subscribers = match self.subscribers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers.insert(id)
        };
        if added {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.subscribers_path)
                .map_err(|source| NotifyError::Subscribers {
                    path: self.subscribers_path.clone(),
                    source,
                })?;
            writeln!(file, "{id}").map_err(|source| NotifyError::Subscribers {
                path: self.subscribers_path.clone(),
                source,
            })?;
        }
        Ok(added)
    }

    async fn send(&self, chat_id: i64, text: &str) {
        let result = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                self.logger.warn(
                    "notify",
                    format!("telegram rejected message to {chat_id}: {}", response.status()),
                );
            }
            Err(err) => {
                self.logger
                    .warn("notify", format!("telegram send to {chat_id} failed: {err}"));
            }
            Ok(_) => {}
        }
    }

    /// Long-poll `getUpdates`, auto-subscribing every chat that writes to
    /// the bot and answering with the current tracking status. Runs until
    /// `shutdown` fires.
    pub async fn run_update_loop(
        self: Arc<Self>,
        status: Arc<dyn StatusSource>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut offset: i64 = 0;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                updates = self.poll_updates(offset) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let Some(message) = update.message else { continue };
                        self.handle_incoming(message.chat.id, status.as_ref()).await;
                    }
                }
            }
        }
    }

    async fn poll_updates(&self, offset: i64) -> Vec<TelegramUpdate> {
        let result = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&[("offset", offset.to_string()), ("timeout", "25".to_string())])
            .timeout(Duration::from_secs(30))
            .send()
            .await;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.logger
                    .warn("notify", format!("telegram getUpdates failed: {err}"));
                tokio::time::sleep(Duration::from_secs(5)).await;
                return Vec::new();
            }
        };
        match response.json::<UpdatesResponse>().await {
            Ok(parsed) if parsed.ok => parsed.result,
            Ok(_) => Vec::new(),
            Err(err) => {
                self.logger
                    .warn("notify", format!("telegram getUpdates body invalid: {err}"));
                Vec::new()
            }
        }
    }

    async fn handle_incoming(&self, chat_id: i64, status: &dyn StatusSource) {
        let reply = match self.add_subscriber(chat_id) {
            Ok(true) => "You have been subscribed!",
            Ok(false) => "You are already subscribed!",
            Err(err) => {
                self.logger
                    .warn("notify", format!("cannot persist subscriber {chat_id}: {err}"));
                "Subscription could not be saved."
            }
        };
        self.send(chat_id, reply).await;
        for line in status.status_lines() {
            self.send(chat_id, &line).await;
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn broadcast(&self, message: &str) {
        for id in self.subscriber_ids() {
            self.send(id, message).await;
        }
    }
}

fn load_subscribers(path: &PathBuf) -> Result<HashSet<i64>, NotifyError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(source) => {
            return Err(NotifyError::Subscribers {
                path: path.clone(),
                source,
            })
        }
    };
    let mut subscribers = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| NotifyError::Subscribers {
            path: path.clone(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(id) = trimmed.parse::<i64>() {
            subscribers.insert(id);
        }
    }
    Ok(subscribers)
}
