//! Startup configuration: an optional TOML file overlaid by environment variables

use chrono_tz::Tz;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DeployError;
use crate::gate::RunPolicy;

const DEFAULT_SCRIPT_NAME: &str = "on-push-to-repo.sh";
const DEFAULT_PORT: u16 = 4000;
const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";
const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_TIMEZONE: &str = "Europe/Paris";
const DEFAULT_SUMMARY_MAX_CHARS: usize = 20_000;
const DEFAULT_ERROR_TAIL_LINES: usize = 30;
const DEFAULT_SUCCESS_TAIL_LINES: usize = 20;

/// Environment variable naming an optional TOML config file
pub const CONFIG_PATH_ENV: &str = "DEPLOY_CONFIG";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeployConfig {
    pub webhook_secret: Option<String>,
    pub projects_root: PathBuf,
    pub script_name: String,
    pub port: u16,
    pub bind_address: Option<String>,
    pub target_branch: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_api_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_api_url: String,
    /// 0 disables the limit
    pub run_timeout_secs: u64,
    pub concurrency_policy: RunPolicy,
    pub timezone: String,
    pub notify_on_auth_failure: bool,
    pub summary_max_chars: usize,
    pub error_tail_lines: usize,
    pub success_tail_lines: usize,
    pub log_dir: Option<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            projects_root: PathBuf::new(),
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
            port: DEFAULT_PORT,
            bind_address: None,
            target_branch: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
            telegram_api_url: DEFAULT_TELEGRAM_API_URL.to_string(),
            openai_api_key: None,
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            openai_api_url: DEFAULT_OPENAI_API_URL.to_string(),
            run_timeout_secs: DEFAULT_TIMEOUT_SECS,
            concurrency_policy: RunPolicy::default(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            notify_on_auth_failure: false,
            summary_max_chars: DEFAULT_SUMMARY_MAX_CHARS,
            error_tail_lines: DEFAULT_ERROR_TAIL_LINES,
            success_tail_lines: DEFAULT_SUCCESS_TAIL_LINES,
            log_dir: None,
        }
    }
}

impl DeployConfig {
    /// Builds the configuration from the process environment, reading the
    /// TOML file named by `DEPLOY_CONFIG` first when it is set.
    pub fn load() -> Result<Self, DeployError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`DeployConfig::load`] with an injectable variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DeployError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => load_config_file(Path::new(&path))?,
            None => DeployConfig::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), DeployError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset, as with an untouched .env template
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("GITHUB_WEBHOOK_SECRET") {
            self.webhook_secret = Some(v);
        }
        if let Some(v) = var("PROJECTS_FOLDER") {
            self.projects_root = PathBuf::from(v);
        }
        if let Some(v) = var("DEPLOY_SCRIPT_NAME") {
            self.script_name = v;
        }
        if let Some(v) = var("PORT") {
            self.port = parse_number("PORT", &v)?;
        }
        if let Some(v) = var("BIND_ADDRESS") {
            self.bind_address = Some(v);
        }
        if let Some(v) = var("TARGET_BRANCH") {
            self.target_branch = Some(v);
        }
        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = Some(v);
        }
        if let Some(v) = var("TELEGRAM_CHAT_ID") {
            self.telegram_chat_id = Some(v);
        }
        if let Some(v) = var("TELEGRAM_API_URL") {
            self.telegram_api_url = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        if let Some(v) = var("OPENAI_MODEL") {
            self.openai_model = v;
        }
        if let Some(v) = var("OPENAI_API_URL") {
            self.openai_api_url = v;
        }
        if let Some(v) = var("DEPLOY_TIMEOUT_SECS") {
            self.run_timeout_secs = parse_number("DEPLOY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("CONCURRENCY_POLICY") {
            self.concurrency_policy = v.parse()?;
        }
        if let Some(v) = var("NOTIFY_TIMEZONE") {
            self.timezone = v;
        }
        if let Some(v) = var("NOTIFY_ON_AUTH_FAILURE") {
            self.notify_on_auth_failure = parse_bool("NOTIFY_ON_AUTH_FAILURE", &v)?;
        }
        if let Some(v) = var("SUMMARY_MAX_CHARS") {
            self.summary_max_chars = parse_number("SUMMARY_MAX_CHARS", &v)?;
        }
        if let Some(v) = var("ERROR_TAIL_LINES") {
            self.error_tail_lines = parse_number("ERROR_TAIL_LINES", &v)?;
        }
        if let Some(v) = var("SUCCESS_TAIL_LINES") {
            self.success_tail_lines = parse_number("SUCCESS_TAIL_LINES", &v)?;
        }
        if let Some(v) = var("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), DeployError> {
        if self.projects_root.as_os_str().is_empty() {
            return Err(DeployError::Config(
                "PROJECTS_FOLDER (projects_root) must be set".to_string(),
            ));
        }
        if self.script_name.contains('/') || self.script_name.contains('\\') {
            return Err(DeployError::Config(format!(
                "script name '{}' must be a bare file name",
                self.script_name
            )));
        }
        if self.summary_max_chars == 0 {
            return Err(DeployError::Config(
                "SUMMARY_MAX_CHARS (summary_max_chars) must be greater than 0".to_string(),
            ));
        }
        self.tz()?;
        Ok(())
    }

    /// Address the HTTP server binds to
    pub fn listen_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }

    /// Maximum run duration, `None` when unbounded
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    /// Timezone used for notification timestamps
    pub fn tz(&self) -> Result<Tz, DeployError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| DeployError::Config(format!("Invalid timezone '{}': {}", self.timezone, e)))
    }

    /// Bot token and chat id, when both are configured
    pub fn telegram_credentials(&self) -> Option<(&str, &str)> {
        match (&self.telegram_bot_token, &self.telegram_chat_id) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => {
                Some((token.as_str(), chat.as_str()))
            }
            _ => None,
        }
    }
}

/// Load and parse a TOML configuration file
pub fn load_config_file(path: &Path) -> Result<DeployConfig, DeployError> {
    let config_str = fs::read_to_string(path).map_err(|e| {
        DeployError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
    })?;

    let config: DeployConfig = toml::from_str(&config_str)?;
    Ok(config)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, DeployError> {
    value
        .trim()
        .parse()
        .map_err(|_| DeployError::Config(format!("{} must be a number, got '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, DeployError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DeployError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, value
        ))),
    }
}
