use std::io;

/// Error type for push_deploy_notifier operations
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid repository name: {0:?}")]
    InvalidRepositoryName(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Script execution failed: {0}")]
    ScriptExecution(String),

    #[error("Summarization failed: {0}")]
    Summarization(String),

    #[error("Notification delivery failed: {0}")]
    NotificationDelivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Helper type for Results that use DeployError
pub type Result<T> = std::result::Result<T, DeployError>;
