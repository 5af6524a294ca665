use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Metadata about the pushed head commit, when the payload carries it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitInfo {
    pub sha: Option<String>,
    pub message: Option<String>,
    pub author: Option<String>,
}

impl CommitInfo {
    /// `abc1234 by Jane: first line of message`
    pub fn describe(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(sha) = &self.sha {
            parts.push(sha.chars().take(7).collect::<String>());
        }
        if let Some(author) = &self.author {
            parts.push(format!("by {}", author));
        }
        let mut line = parts.join(" ");
        if let Some(first) = self.message.as_deref().and_then(|m| m.lines().next()) {
            if line.is_empty() {
                line = first.to_string();
            } else {
                line = format!("{}: {}", line, first);
            }
        }
        (!line.is_empty()).then_some(line)
    }
}

/// A push that passed signature verification
#[derive(Debug, Clone)]
pub struct DeploymentEvent {
    pub repository_name: String,
    /// Full reference, e.g. `refs/heads/main`
    pub git_ref: String,
    pub commit: CommitInfo,
    pub pusher: Option<String>,
    pub repository_url: Option<String>,
}

impl DeploymentEvent {
    pub fn new(repository_name: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            repository_name: repository_name.into(),
            git_ref: git_ref.into(),
            commit: CommitInfo::default(),
            pusher: None,
            repository_url: None,
        }
    }

    /// Branch name with the `refs/heads/` prefix removed
    pub fn branch(&self) -> &str {
        short_branch(&self.git_ref)
    }
}

pub fn short_branch(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

/// Terminal status of a script run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Result of running a deployment script to completion
#[derive(Debug, Clone)]
pub struct DeploymentOutcome {
    pub run_id: Uuid,
    pub repository: String,
    /// `None` when the process was killed by a signal or by the timeout
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl DeploymentOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn status(&self) -> RunStatus {
        if self.timed_out {
            RunStatus::TimedOut
        } else if self.succeeded() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }
}

/// What happened to one webhook-triggered run
#[derive(Debug)]
pub enum RunReport {
    /// The push targeted a branch other than the configured one
    BranchIgnored { branch: String },
    /// Another run of the repository was in flight and the policy rejects overlaps
    Busy,
    /// The script could not be started
    SpawnFailed { reason: String },
    Finished(DeploymentOutcome),
}

/// Formats a duration as `1m 05s` / `42s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
