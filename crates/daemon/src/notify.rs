//! Status notifications
//!
//! A [`NotificationSink`] can post a new status message and edit the most
//! recent one. [`TelegramSink`] talks to the Telegram Bot API; [`NullSink`]
//! is used when no credentials are configured.

use crate::commit::{CommitOutcome, OutcomeKind};
use crate::config::NotifyConfig;
use crate::summary::RunSummary;
use async_trait::async_trait;
use humansize::{format_size, WINDOWS};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API rejected the message: {0}")]
    Api(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Posts a new status message.
    async fn post(&self, text: &str) -> Result<(), NotifyError>;

    /// Replaces the text of the most recently posted message, or posts one
    /// if nothing was posted yet.
    async fn update(&self, text: &str) -> Result<(), NotifyError>;
}

/// Sink that drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn post(&self, _text: &str) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn update(&self, _text: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Telegram bot sink. Messages use Markdown and carry the host label.
pub struct TelegramSink {
    client: Client,
    endpoint: String,
    chat_id: String,
    host: String,
    last_message: Mutex<Option<i64>>,
}

impl TelegramSink {
    pub fn new(config: &NotifyConfig) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("failed to build HTTP client: {}", e);
                Client::new()
            });

        Self {
            client,
            endpoint: format!(
                "{}/bot{}",
                config.api_base.trim_end_matches('/'),
                config.bot_token
            ),
            chat_id: config.chat_id.clone(),
            host: config.host.clone(),
            last_message: Mutex::new(None),
        }
    }

    fn decorate(&self, text: &str) -> String {
        with_host(text, &self.host)
    }

    fn last_message(&self) -> Option<i64> {
        self.last_message.lock().map(|id| *id).unwrap_or(None)
    }

    fn remember(&self, id: i64) {
        if let Ok(mut last) = self.last_message.lock() {
            *last = Some(id);
        }
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<ApiResponse, NotifyError> {
        let url = format!("{}/{}", self.endpoint, method);
        let response: ApiResponse = self.client.post(&url).json(&body).send().await?.json().await?;
        if !response.ok {
            return Err(NotifyError::Api(
                response.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn post(&self, text: &str) -> Result<(), NotifyError> {
        let body = json!({
            "chat_id": self.chat_id,
            "text": self.decorate(text),
            "parse_mode": "Markdown",
        });
        let response = self.call("sendMessage", body).await?;
        if let Some(sent) = response.result {
            debug!("posted status message {}", sent.message_id);
            self.remember(sent.message_id);
        }
        Ok(())
    }

    async fn update(&self, text: &str) -> Result<(), NotifyError> {
        let Some(message_id) = self.last_message() else {
            return self.post(text).await;
        };
        let body = json!({
            "chat_id": self.chat_id,
            "message_id": message_id,
            "text": self.decorate(text),
            "parse_mode": "Markdown",
        });
        self.call("editMessageText", body).await?;
        Ok(())
    }
}

/// Picks the Telegram sink when credentials are present.
pub fn sink_from_config(config: &NotifyConfig) -> Box<dyn NotificationSink> {
    if config.is_enabled() {
        Box::new(TelegramSink::new(config))
    } else {
        debug!("notification credentials not set, notifications disabled");
        Box::new(NullSink)
    }
}

fn with_host(text: &str, host: &str) -> String {
    if host.is_empty() {
        text.to_string()
    } else {
        format!("{}\n*Host:* {}", text, host)
    }
}

/// Human size in binary units, e.g. `1.5 GB`.
pub fn human_size(bytes: u64) -> String {
    format_size(bytes, WINDOWS)
}

/// `new / old * 100`, rounded to two decimals.
pub fn size_percent(original: u64, resulting: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (resulting as f64 / original as f64 * 10_000.0).round() / 100.0
}

pub fn started_message() -> String {
    "*Transcoder Started*".to_string()
}

pub fn stopped_message(summary: &RunSummary) -> String {
    format!("*Transcoder Stopped*\n{}", summary)
}

pub fn progress_message(name: &str, percent: Option<f64>) -> String {
    match percent {
        Some(p) => format!("*{}*\n*Status:* Converting {}%", name, p.floor() as u64),
        None => format!("*{}*\n*Status:* Converting", name),
    }
}

pub fn skipped_message(name: &str, reason: impl std::fmt::Display) -> String {
    format!("*{}*\n*Status:* Skipped ({})", name, reason)
}

pub fn failed_message(name: &str, error: impl std::fmt::Display) -> String {
    format!("*{}*\n*Status:* Failed ({})", name, error)
}

pub fn outcome_message(name: &str, outcome: &CommitOutcome) -> String {
    let status = match outcome.kind {
        OutcomeKind::Replaced => "Replaced with new",
        OutcomeKind::KeptOriginal => "Kept old",
        OutcomeKind::Interrupted => "Interrupted",
        OutcomeKind::Failed => "Failed",
    };
    match outcome.resulting_size {
        Some(resulting) => format!(
            "*{}*\n*Size:* {} --> {} ({}%)\n*Status:* {}",
            name,
            human_size(outcome.original_size),
            human_size(resulting),
            size_percent(outcome.original_size, resulting),
            status
        ),
        None => format!("*{}*\n*Status:* {}", name, status),
    }
}
