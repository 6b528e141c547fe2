//! # Command Executor
//!
//! Sends one command into a project's running container and streams its
//! output to the project's hub channel until the container signals
//! completion.
//!
//! ```text
//! run(project, train, params)
//!   ├─ claim job slot (NotAttached / JobInProgress)
//!   ├─ encode "train\n{json}\n"  or  "predict\n<raw>\n"
//!   ├─ status Wait → Running
//!   ├─ attach, write payload
//!   ├─ loop LogLines::next_event()
//!   │     Line  ──► hub.publish(project, LogFrame)
//!   │     Completed ──► status → Wait, Ok(JobOutcome)
//!   │     Closed / read error ──► lifecycle.stop(), Err(StreamTerminated)
//!   └─ stop() from outside ──► Err(JobCancelled)
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{PREDICT_SENTINEL, QUIESCENCE_WINDOW, TRAIN_SENTINEL};
use crate::error::{Error, Result};
use crate::hub::BroadcastHub;
use crate::lifecycle::LifecycleManager;
use crate::protocol::{LogFrame, OutboundFrame};
use crate::runtime::AttachedIo;
use crate::state::ProjectStatus;
use crate::stream::{LogEvent, LogLines};

/// The two commands the in-container agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Train,
    Predict,
}

impl CommandKind {
    /// Token written as the first line of the invocation.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Predict => "predict",
        }
    }

    /// Marker the container prints when this command finishes.
    #[must_use]
    pub fn sentinel(self) -> &'static str {
        match self {
            Self::Train => TRAIN_SENTINEL,
            Self::Predict => PREDICT_SENTINEL,
        }
    }

    /// Message reported on successful completion.
    #[must_use]
    pub fn completion_message(self) -> &'static str {
        match self {
            Self::Train => "training completed",
            Self::Predict => "prediction completed",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

impl std::str::FromStr for CommandKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Self::Train),
            "predict" => Ok(Self::Predict),
            other => Err(Error::Internal(format!("unknown command '{other}'"))),
        }
    }
}

/// Successful end of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub project_id: u64,
    pub command: CommandKind,
    /// Lines published during the job.
    pub lines: usize,
    pub message: String,
}

/// Builds the bytes written to the container's stdin.
#[must_use]
pub fn encode_invocation(command: CommandKind, payload: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.token().len() + payload.len() + 2);
    bytes.extend_from_slice(command.token().as_bytes());
    bytes.push(b'\n');
    bytes.extend_from_slice(payload.as_bytes());
    bytes.push(b'\n');
    bytes
}

enum StreamEnd {
    Completed { lines: usize },
    Closed { lines: usize },
    Cancelled,
}

/// Runs commands in project containers.
#[derive(Debug)]
pub struct CommandExecutor {
    lifecycle: Arc<LifecycleManager>,
    hub: Arc<BroadcastHub>,
    quiescence: Duration,
}

impl CommandExecutor {
    pub fn new(lifecycle: Arc<LifecycleManager>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            lifecycle,
            hub,
            quiescence: QUIESCENCE_WINDOW,
        }
    }

    /// Overrides the partial-line flush window.
    #[must_use]
    pub fn with_quiescence(mut self, window: Duration) -> Self {
        self.quiescence = window;
        self
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Runs `command` in the project's container and streams its output.
    ///
    /// For `train`, `parameters` is ignored and the project's merged
    /// hyperparameters are sent as JSON. For `predict`, `parameters` is sent
    /// verbatim.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAttached`] / [`Error::JobInProgress`]: nothing was sent
    /// - [`Error::JobCancelled`]: the project was stopped mid-job
    /// - [`Error::StreamTerminated`]: the stream ended without a sentinel or
    ///   failed; the container has been stopped
    pub async fn run(
        &self,
        project_id: u64,
        command: CommandKind,
        parameters: &str,
    ) -> Result<JobOutcome> {
        let guard = self.lifecycle.begin_job(project_id)?;
        let handle = self
            .lifecycle
            .handle(project_id)
            .ok_or(Error::NotAttached(project_id))?;

        let payload = match command {
            CommandKind::Train => {
                let hyperparameters = self
                    .lifecycle
                    .status_tracker()
                    .store()
                    .get_hyperparameters(project_id)
                    .await
                    .map_err(|e| Error::Persistence(e.to_string()))?;
                serde_json::to_string(&hyperparameters)?
            }
            CommandKind::Predict => parameters.to_string(),
        };
        let invocation = encode_invocation(command, &payload);

        self.lifecycle
            .status_tracker()
            .transition(project_id, ProjectStatus::Running)
            .await?;
        info!(project = project_id, command = %command, container = %handle.name, "job started");

        let result = self
            .stream(project_id, command, &handle.name, &invocation, guard.cancellation())
            .await;
        drop(guard);

        match result {
            Ok(StreamEnd::Completed { lines }) => {
                self.lifecycle
                    .status_tracker()
                    .transition(project_id, ProjectStatus::Wait)
                    .await?;
                info!(project = project_id, command = %command, lines, "job completed");
                Ok(JobOutcome {
                    project_id,
                    command,
                    lines,
                    message: command.completion_message().to_string(),
                })
            }
            Ok(StreamEnd::Cancelled) => {
                info!(project = project_id, command = %command, "job cancelled by stop");
                Err(Error::JobCancelled(project_id))
            }
            Ok(StreamEnd::Closed { lines }) => {
                self.abort(
                    project_id,
                    format!(
                        "output closed after {lines} lines without {}",
                        command.sentinel()
                    ),
                )
                .await
            }
            Err(e) => self.abort(project_id, e.to_string()).await,
        }
    }

    async fn stream(
        &self,
        project_id: u64,
        command: CommandKind,
        container: &str,
        invocation: &[u8],
        cancel: &CancellationToken,
    ) -> Result<StreamEnd> {
        let AttachedIo {
            mut stdin,
            stdout,
            session: _session,
        } = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            io = self.lifecycle.runtime().attach(container) => io?,
        };

        stdin.write_all(invocation).await?;
        stdin.flush().await?;
        debug!(project = project_id, bytes = invocation.len(), "invocation sent");

        let channel = project_id.to_string();
        let mut lines = LogLines::new(stdout, self.quiescence);
        let mut published = 0;

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                event = lines.next_event() => event?,
            };

            match event {
                LogEvent::Line(line) => {
                    let frame = OutboundFrame::from(LogFrame::new(line, command));
                    self.hub.publish(&channel, &frame);
                    published += 1;
                }
                LogEvent::Completed => {
                    if lines.fallback_decodes() > 0 {
                        debug!(project = project_id, count = lines.fallback_decodes(), "fallback decodes");
                    }
                    return Ok(StreamEnd::Completed { lines: published });
                }
                LogEvent::Closed => return Ok(StreamEnd::Closed { lines: published }),
            }
        }
    }

    async fn abort(&self, project_id: u64, reason: String) -> Result<JobOutcome> {
        error!(project = project_id, %reason, "job terminated abnormally, stopping container");
        if let Err(e) = self.lifecycle.stop(project_id).await {
            warn!(project = project_id, error = %e, "stop after stream failure failed");
            if let Err(e) = self
                .lifecycle
                .status_tracker()
                .transition(project_id, ProjectStatus::Stopped)
                .await
            {
                warn!(project = project_id, error = %e, "status transition skipped");
            }
        }
        Err(Error::StreamTerminated { project_id, reason })
    }
}
