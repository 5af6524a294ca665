//! Operator notifications
//!
//! [`Notifier`] renders a [`NotificationMessage`] and hands it to a
//! [`NotificationSink`]. Delivery is best effort: failures are logged and
//! discarded, and without a configured sink every call is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::classify::{head_chars, head_utf16, tail_utf16, utf16_len};
use crate::error::DeployError;

/// Telegram rejects messages longer than this many UTF-16 code units
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

/// Marks where the front of an oversized detail block was cut
const CUT_MARKER: &str = "…";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Start,
    Success,
    Failure,
    Warning,
    TimedOut,
    Security,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Start => "STARTING",
            Severity::Success => "SUCCESS",
            Severity::Failure => "FAILURE",
            Severity::Warning => "WARNING",
            Severity::TimedOut => "TIMEOUT",
            Severity::Security => "SECURITY",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified, human readable status update about one repository
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub severity: Severity,
    pub repository: String,
    pub headline: String,
    pub detail: Option<String>,
}

impl NotificationMessage {
    pub fn new(severity: Severity, repository: impl Into<String>, headline: impl Into<String>) -> Self {
        Self {
            severity,
            repository: repository.into(),
            headline: headline.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.trim().is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    /// `[14 oct 09:30] SUCCESS site-a: deployment finished`, followed by the
    /// detail block when there is one.
    ///
    /// The result is at most `max_len` UTF-16 code units. When it has to
    /// shrink, the detail loses its beginning so the end of a log survives.
    pub fn render(&self, tz: &Tz, at: DateTime<Utc>, max_len: usize) -> String {
        let header = format!(
            "[{}] {} {}: {}",
            timestamp(tz, at),
            self.severity,
            self.repository,
            self.headline
        );
        let mut text = head_utf16(&header, max_len).to_string();
        let Some(detail) = &self.detail else {
            return text;
        };

        let budget = max_len.saturating_sub(utf16_len(&text) + 2);
        if budget <= utf16_len(CUT_MARKER) {
            return text;
        }
        text.push_str("\n\n");
        if utf16_len(detail) <= budget {
            text.push_str(detail);
        } else {
            text.push_str(CUT_MARKER);
            text.push_str(tail_utf16(detail, budget - utf16_len(CUT_MARKER)));
        }
        text
    }
}

/// Day, short month and time in `tz`, lowercased: `14 oct 09:30`
pub fn timestamp(tz: &Tz, at: DateTime<Utc>) -> String {
    at.with_timezone(tz)
        .format("%d %b %H:%M")
        .to_string()
        .to_lowercase()
}

/// Remote channel able to deliver a text message
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), DeployError>;

    /// Longest text, in UTF-16 code units, the channel accepts
    fn max_message_len(&self) -> usize {
        usize::MAX
    }
}

/// Sends messages to one Telegram chat through the Bot API
pub struct TelegramSink {
    client: reqwest::Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(api_url: &str, bot_token: &str, chat_id: &str) -> Result<Self, DeployError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DeployError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn send(&self, text: &str) -> Result<(), DeployError> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": head_utf16(text, TELEGRAM_MAX_MESSAGE_LEN),
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            // reqwest errors embed the URL, which carries the bot token
            .map_err(|e| DeployError::NotificationDelivery(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeployError::NotificationDelivery(format!(
                "Telegram returned HTTP {}: {}",
                status.as_u16(),
                head_chars(&body, 200)
            )));
        }
        Ok(())
    }

    fn max_message_len(&self) -> usize {
        TELEGRAM_MAX_MESSAGE_LEN
    }
}

/// Error boundary around an optional [`NotificationSink`]
#[derive(Clone)]
pub struct Notifier {
    sink: Option<Arc<dyn NotificationSink>>,
    tz: Tz,
}

impl Notifier {
    pub fn new(sink: Option<Arc<dyn NotificationSink>>, tz: Tz) -> Self {
        Self { sink, tz }
    }

    #[cfg(test)]
    pub fn disabled(tz: Tz) -> Self {
        Self { sink: None, tz }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Delivers `message`. Never fails; errors are logged.
    pub async fn notify(&self, message: &NotificationMessage) {
        let Some(sink) = &self.sink else {
            debug!(
                "Notifications not configured, dropping {} message for '{}'",
                message.severity, message.repository
            );
            return;
        };
        let text = message.render(&self.tz, Utc::now(), sink.max_message_len());
        if let Err(e) = sink.send(&text).await {
            warn!(
                "Failed to send {} notification for '{}': {}",
                message.severity, message.repository, e
            );
        }
    }

    /// Sends `message` from a background task so the caller never waits on
    /// the network.
    pub fn notify_detached(&self, message: NotificationMessage) {
        if self.sink.is_none() {
            return;
        }
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.notify(&message).await;
        });
    }
}
