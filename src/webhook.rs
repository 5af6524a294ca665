//! Push payload as sent by the source-control host

use serde::Deserialize;

use crate::deployment::{CommitInfo, DeploymentEvent};
use crate::error::DeployError;

/// Commit messages can be very long for squashed commits
const MAX_COMMIT_MSG_LEN: usize = 500;

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: Repository,
    after: Option<String>,
    head_commit: Option<HeadCommit>,
    pusher: Option<Person>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeadCommit {
    message: Option<String>,
    author: Option<Person>,
}

#[derive(Debug, Deserialize)]
struct Person {
    name: Option<String>,
}

/// Parses a push event body. Call only after the signature over the same
/// bytes has been verified.
pub fn parse_push_event(body: &[u8]) -> Result<DeploymentEvent, DeployError> {
    let payload: PushPayload =
        serde_json::from_slice(body).map_err(|e| DeployError::InvalidPayload(e.to_string()))?;

    let commit_message = payload
        .head_commit
        .as_ref()
        .and_then(|c| c.message.as_deref())
        .map(|s| {
            if s.chars().count() > MAX_COMMIT_MSG_LEN {
                let cut: String = s.chars().take(MAX_COMMIT_MSG_LEN).collect();
                format!("{}... (truncated)", cut)
            } else {
                s.to_string()
            }
        });
    let commit_author = payload
        .head_commit
        .as_ref()
        .and_then(|c| c.author.as_ref())
        .and_then(|a| a.name.clone());

    Ok(DeploymentEvent {
        repository_name: payload.repository.name,
        git_ref: payload.git_ref,
        commit: CommitInfo {
            sha: payload.after,
            message: commit_message,
            author: commit_author,
        },
        pusher: payload.pusher.and_then(|p| p.name),
        repository_url: payload.repository.html_url,
    })
}
