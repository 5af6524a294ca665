pub mod api;
pub mod classify;
pub mod config;
pub mod deployment;
pub mod error;
pub mod gate;
pub mod logging;
pub mod notifier;
pub mod runner;
pub mod signature;
pub mod summarizer;
pub mod webhook;

use axum::extract::DefaultBodyLimit;
use axum::{Router, routing};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub use config::DeployConfig;
use error::DeployError;
use notifier::{NotificationSink, Notifier, TelegramSink};
use runner::DeploymentRunner;
use summarizer::{OpenAiSummarizer, Summarizer};

/// GitHub caps webhook payloads at 25 MB
const MAX_PAYLOAD_BYTES: usize = 25 * 1024 * 1024;

pub struct AppState {
    pub config: Arc<DeployConfig>,
    pub runner: Arc<DeploymentRunner>,
    pub notifier: Notifier,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wires the runner from explicit collaborators
    pub fn new(
        config: DeployConfig,
        sink: Option<Arc<dyn NotificationSink>>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Result<Self, DeployError> {
        let config = Arc::new(config);
        let notifier = Notifier::new(sink, config.tz()?);
        let runner = Arc::new(DeploymentRunner::new(
            Arc::clone(&config),
            notifier.clone(),
            summarizer,
        ));
        Ok(Self {
            config,
            runner,
            notifier,
            start_time: Instant::now(),
            started_at: Utc::now(),
        })
    }

    /// Builds Telegram and OpenAI clients for whatever credentials are configured
    pub fn from_config(config: DeployConfig) -> Result<Self, DeployError> {
        let sink: Option<Arc<dyn NotificationSink>> = match config.telegram_credentials() {
            Some((token, chat_id)) => Some(Arc::new(TelegramSink::new(
                &config.telegram_api_url,
                token,
                chat_id,
            )?)),
            None => {
                warn!("TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID not set, notifications disabled");
                None
            }
        };

        let summarizer: Option<Arc<dyn Summarizer>> = match config.openai_api_key.as_deref() {
            Some(key) if !key.is_empty() => Some(Arc::new(OpenAiSummarizer::new(
                &config.openai_api_url,
                key,
                &config.openai_model,
                config.summary_max_chars,
            )?)),
            _ => {
                info!("OPENAI_API_KEY not set, failure logs will be sent unsummarized");
                None
            }
        };

        if config.webhook_secret.as_deref().is_none_or(str::is_empty) {
            warn!("GITHUB_WEBHOOK_SECRET not set, every webhook call will be rejected");
        }

        Self::new(config, sink, summarizer)
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", routing::get(api::health::root))
        .route("/webhook", routing::post(api::webhook::handle_webhook))
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_BYTES))
        .with_state(state)
}
