//! Deployment orchestration: from a verified push to operator notifications

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::DeployConfig;
use crate::classify::{is_warning_worthy, strip_ansi, tail};
use crate::deployment::{
    DeploymentEvent, DeploymentOutcome, RunReport, format_duration, short_branch,
};
use crate::error::DeployError;
use crate::gate::RunGate;
use crate::notifier::{NotificationMessage, Notifier, Severity};
use crate::summarizer::{ExcerptLimits, Summarizer, summarize_or_raw};

/// GitHub's own limit on repository name length
const MAX_REPOSITORY_NAME_LEN: usize = 100;

/// Stderr shorter than this is not worth a warning round-trip
const MIN_WARNING_STDERR_CHARS: usize = 16;

/// Variables passed through from the service's own environment
const PASSTHROUGH_ENV: [&str; 6] = ["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM"];

/// Synchronous decision taken before anything runs
#[derive(Debug, PartialEq)]
pub enum Plan {
    /// Branch filter did not match
    Skip { branch: String },
    Deploy { script: PathBuf },
}

/// Result of handing an event to the background
#[derive(Debug)]
pub enum Dispatch {
    Ignored { branch: String },
    Started(JoinHandle<RunReport>),
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Runs per-repository deployment scripts and reports their outcome
pub struct DeploymentRunner {
    config: Arc<DeployConfig>,
    notifier: Notifier,
    summarizer: Option<Arc<dyn Summarizer>>,
    gate: RunGate,
}

impl DeploymentRunner {
    pub fn new(
        config: Arc<DeployConfig>,
        notifier: Notifier,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        let gate = RunGate::new(config.concurrency_policy);
        Self {
            config,
            notifier,
            summarizer,
            gate,
        }
    }

    /// Applies the branch filter and resolves the script path.
    pub fn plan(&self, event: &DeploymentEvent) -> Result<Plan, DeployError> {
        if let Some(target) = self.config.target_branch.as_deref() {
            let branch = event.branch();
            if short_branch(target) != branch {
                info!(
                    "Push to '{}' of '{}' does not match target branch '{}', skipping",
                    event.git_ref, event.repository_name, target
                );
                return Ok(Plan::Skip {
                    branch: branch.to_string(),
                });
            }
        }

        validate_repository_name(&event.repository_name)?;
        let script = self
            .config
            .projects_root
            .join(&event.repository_name)
            .join(&self.config.script_name);
        Ok(Plan::Deploy { script })
    }

    /// Plans and runs `event` to completion on the current task.
    pub async fn run(&self, event: DeploymentEvent) -> Result<RunReport, DeployError> {
        match self.plan(&event)? {
            Plan::Skip { branch } => Ok(RunReport::BranchIgnored { branch }),
            Plan::Deploy { script } => Ok(self.execute(event, script).await),
        }
    }

    /// Plans `event` and, when there is something to deploy, runs it on a
    /// detached task. Returns without waiting for the script.
    pub fn dispatch(self: &Arc<Self>, event: DeploymentEvent) -> Result<Dispatch, DeployError> {
        match self.plan(&event)? {
            Plan::Skip { branch } => Ok(Dispatch::Ignored { branch }),
            Plan::Deploy { script } => {
                let runner = Arc::clone(self);
                let handle = tokio::spawn(async move { runner.execute(event, script).await });
                Ok(Dispatch::Started(handle))
            }
        }
    }

    async fn execute(&self, event: DeploymentEvent, script: PathBuf) -> RunReport {
        let repository = event.repository_name.clone();

        let Some(_permit) = self.gate.admit(&repository).await else {
            warn!(
                "Deployment of '{}' already in progress, dropping push to '{}'",
                repository, event.git_ref
            );
            self.notifier
                .notify(&NotificationMessage::new(
                    Severity::Warning,
                    &repository,
                    format!(
                        "push to {} skipped, a deployment is already running",
                        event.branch()
                    ),
                ))
                .await;
            return RunReport::Busy;
        };

        let run_id = Uuid::now_v7();
        info!(
            "Run {} - push to '{}' of '{}', executing {}",
            run_id,
            event.git_ref,
            repository,
            script.display()
        );

        let mut starting = NotificationMessage::new(
            Severity::Start,
            &repository,
            format!("deployment starting on {}", event.branch()),
        );
        let about: Vec<String> = event
            .commit
            .describe()
            .into_iter()
            .chain(event.repository_url.clone())
            .collect();
        if !about.is_empty() {
            starting = starting.with_detail(about.join("\n"));
        }
        self.notifier.notify(&starting).await;

        let outcome = match self.spawn_and_capture(run_id, &event, &script).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Run {} - {}", run_id, e);
                self.notifier
                    .notify(
                        &NotificationMessage::new(
                            Severity::Failure,
                            &repository,
                            "deployment script could not be started",
                        )
                        .with_detail(e.to_string()),
                    )
                    .await;
                return RunReport::SpawnFailed {
                    reason: e.to_string(),
                };
            }
        };

        self.report(&outcome).await;
        RunReport::Finished(outcome)
    }

    async fn spawn_and_capture(
        &self,
        run_id: Uuid,
        event: &DeploymentEvent,
        script: &Path,
    ) -> Result<DeploymentOutcome, DeployError> {
        // A relative program path would be resolved against the new cwd on some platforms
        let program = std::path::absolute(script)?;
        let workdir = program.parent().unwrap_or(self.config.projects_root.as_path());
        let mut command = Command::new(&program);
        command
            .current_dir(workdir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in PASSTHROUGH_ENV {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }
        command
            .env("DEPLOY_RUN_ID", run_id.to_string())
            .env("DEPLOY_REPOSITORY", &event.repository_name)
            .env("DEPLOY_REF", &event.git_ref)
            .env("DEPLOY_BRANCH", event.branch());
        let optional = [
            ("DEPLOY_COMMIT_SHA", &event.commit.sha),
            ("DEPLOY_COMMIT_MESSAGE", &event.commit.message),
            ("DEPLOY_COMMIT_AUTHOR", &event.commit.author),
            ("DEPLOY_PUSHER", &event.pusher),
            ("DEPLOY_REPOSITORY_URL", &event.repository_url),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                command.env(key, value);
            }
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            DeployError::ScriptExecution(format!("failed to start {}: {}", script.display(), e))
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(DeployError::ScriptExecution(
                "child process has no output pipes".to_string(),
            ));
        };
        let mut lines = SplitStream::new(BufReader::new(stdout).split(b'\n'))
            .map(|segment| (OutputStream::Stdout, segment))
            .merge(
                SplitStream::new(BufReader::new(stderr).split(b'\n'))
                    .map(|segment| (OutputStream::Stderr, segment)),
            );

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let repository = event.repository_name.as_str();

        let capture = async {
            while let Some((source, segment)) = lines.next().await {
                let bytes = match segment {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Run {} - error reading script output: {}", run_id, e);
                        continue;
                    }
                };
                let line = String::from_utf8_lossy(&bytes);
                let line = line.trim_end_matches('\r');
                match source {
                    OutputStream::Stdout => {
                        info!(target: "deploy::stdout", %run_id, repository, "{}", line);
                        stdout_buf.push_str(line);
                        stdout_buf.push('\n');
                    }
                    OutputStream::Stderr => {
                        info!(target: "deploy::stderr", %run_id, repository, "{}", line);
                        stderr_buf.push_str(line);
                        stderr_buf.push('\n');
                    }
                }
            }
            child.wait().await
        };

        let waited: Option<std::io::Result<ExitStatus>> = match self.config.run_timeout() {
            Some(limit) => tokio::time::timeout(limit, capture).await.ok(),
            None => Some(capture.await),
        };

        let (exit_code, timed_out) = match waited {
            Some(Ok(status)) => (status.code(), false),
            Some(Err(e)) => {
                return Err(DeployError::ScriptExecution(format!(
                    "failed to wait for {}: {}",
                    script.display(),
                    e
                )));
            }
            None => {
                warn!(
                    "Run {} - '{}' exceeded {:?}, killing it",
                    run_id,
                    repository,
                    self.config.run_timeout()
                );
                if let Err(e) = child.kill().await {
                    error!("Run {} - failed to kill timed out script: {}", run_id, e);
                }
                (None, true)
            }
        };

        let outcome = DeploymentOutcome {
            run_id,
            repository: repository.to_string(),
            exit_code,
            stdout: stdout_buf,
            stderr: stderr_buf,
            timed_out,
            started_at,
            duration: clock.elapsed(),
        };
        info!(
            "Run {} - '{}' finished: {:?} (exit code {:?}), started {} and took {}",
            run_id,
            repository,
            outcome.status(),
            outcome.exit_code,
            outcome.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            format_duration(outcome.duration)
        );
        Ok(outcome)
    }

    /// Sends the terminal notification, then the warning one if stderr calls for it.
    async fn report(&self, outcome: &DeploymentOutcome) {
        let repository = outcome.repository.as_str();
        let took = format_duration(outcome.duration);

        let terminal = if outcome.timed_out {
            NotificationMessage::new(
                Severity::TimedOut,
                repository,
                format!("deployment killed after {}", took),
            )
            .with_detail(format!(
                "Log tail:\n{}",
                tail(&failure_excerpt(outcome), self.config.error_tail_lines)
            ))
        } else if outcome.succeeded() {
            let mut message = NotificationMessage::new(
                Severity::Success,
                repository,
                format!("deployment finished in {}", took),
            );
            if self.config.success_tail_lines > 0 {
                message = message.with_detail(tail(
                    &strip_ansi(&outcome.stdout),
                    self.config.success_tail_lines,
                ));
            }
            message
        } else {
            let exit = outcome
                .exit_code
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "killed by signal".to_string());
            let detail = summarize_or_raw(
                self.summarizer.as_deref(),
                &failure_excerpt(outcome),
                self.limits(),
            )
            .await;
            NotificationMessage::new(
                Severity::Failure,
                repository,
                format!("deployment failed ({}) after {}", exit, took),
            )
            .with_detail(detail)
        };
        self.notifier.notify(&terminal).await;

        let stderr = strip_ansi(&outcome.stderr);
        if stderr.trim().chars().count() >= MIN_WARNING_STDERR_CHARS && is_warning_worthy(&stderr) {
            let headline = if outcome.succeeded() {
                "deployment finished with warnings"
            } else {
                "execution errors present"
            };
            let detail = summarize_or_raw(self.summarizer.as_deref(), &stderr, self.limits()).await;
            self.notifier
                .notify(&NotificationMessage::new(Severity::Warning, repository, headline).with_detail(detail))
                .await;
        }
    }

    fn limits(&self) -> ExcerptLimits {
        ExcerptLimits {
            max_input_chars: self.config.summary_max_chars,
            fallback_lines: self.config.error_tail_lines,
        }
    }
}

/// stderr followed by stdout, without terminal escapes
fn failure_excerpt(outcome: &DeploymentOutcome) -> String {
    let stderr = strip_ansi(&outcome.stderr);
    let stdout = strip_ansi(&outcome.stdout);
    match (stderr.trim().is_empty(), stdout.trim().is_empty()) {
        (false, false) => format!("{}\n{}", stderr.trim_end(), stdout.trim_end()),
        (false, true) => stderr.into_owned(),
        _ => stdout.into_owned(),
    }
}

/// Only names a source-control host could produce are allowed into the
/// filesystem path.
pub fn validate_repository_name(name: &str) -> Result<(), DeployError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if name.is_empty()
        || name.len() > MAX_REPOSITORY_NAME_LEN
        || name == "."
        || name == ".."
        || !name.chars().all(allowed)
    {
        return Err(DeployError::InvalidRepositoryName(name.to_string()));
    }
    Ok(())
}
