use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::DeployError;

/// What to do with a push for a repository that is already deploying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPolicy {
    /// Run overlapping deployments side by side
    Allow,
    /// Drop the new push
    Reject,
    /// Wait for the running deployment to finish first
    #[default]
    Queue,
}

impl FromStr for RunPolicy {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(RunPolicy::Allow),
            "reject" => Ok(RunPolicy::Reject),
            "queue" => Ok(RunPolicy::Queue),
            other => Err(DeployError::Config(format!(
                "Unknown concurrency policy '{}', expected allow, reject or queue",
                other
            ))),
        }
    }
}

/// Held for the duration of a run; releases the repository when dropped.
#[derive(Debug)]
pub struct RunPermit {
    _guard: Option<OwnedMutexGuard<()>>,
}

/// Per-repository in-flight tracking
pub struct RunGate {
    policy: RunPolicy,
    /// one lock per repository name
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RunGate {
    pub fn new(policy: RunPolicy) -> Self {
        Self {
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a permit for `repository`, or `None` when the policy is
    /// [`RunPolicy::Reject`] and a run is already in flight.
    pub async fn admit(&self, repository: &str) -> Option<RunPermit> {
        match self.policy {
            RunPolicy::Allow => Some(RunPermit { _guard: None }),
            RunPolicy::Reject => self
                .slot(repository)
                .try_lock_owned()
                .ok()
                .map(|guard| RunPermit {
                    _guard: Some(guard),
                }),
            RunPolicy::Queue => {
                let guard = self.slot(repository).lock_owned().await;
                Some(RunPermit {
                    _guard: Some(guard),
                })
            }
        }
    }

    fn slot(&self, repository: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            slots
                .entry(repository.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}
