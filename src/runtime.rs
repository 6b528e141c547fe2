//! Container runtime trait - the narrow interface the core uses to drive
//! containers on one runtime endpoint.
//!
//! This trait defines the primitives the lifecycle manager and executor need:
//! - `create` / `start`: bring up a named, interactive container
//! - `stop` / `remove`: tear it down
//! - `state`: query live status
//! - `attach`: open a duplex byte stream to the container's stdin/stdout
//! - `list_containers` / `list_images` / `build_image`: inventory and builds
//!
//! Implementations must report a missing container as
//! [`Error::ContainerNotFound`](crate::error::Error::ContainerNotFound) so that
//! callers can treat it as "already gone".

use crate::catalog::ImageRef;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

// =============================================================================
// Container Status
// =============================================================================

/// Live container status as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container is paused.
    Paused,
    /// Container is restarting.
    Restarting,
    /// Container is being removed.
    Removing,
    /// Container process has exited.
    Exited,
    /// Container is dead (failed removal or OOM).
    Dead,
    /// Container could not be found.
    Unknown,
}

impl ContainerStatus {
    /// Parses the runtime's status word. Unrecognised words map to `Unknown`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Snapshot of a container's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    /// Container name.
    pub name: String,
    /// Container status.
    pub status: ContainerStatus,
    /// Process ID of the container (if running).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Exit code (if exited).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ContainerState {
    /// Creates a new container state.
    pub fn new(name: impl Into<String>, status: ContainerStatus) -> Self {
        Self {
            name: name.into(),
            status,
            pid: None,
            exit_code: None,
        }
    }

    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// Entry of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Runtime container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Image the container was created from.
    pub image: String,
    /// Current status.
    pub status: ContainerStatus,
}

// =============================================================================
// Container Spec
// =============================================================================

/// A host path bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Path on the runtime host.
    pub source: PathBuf,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// Everything the runtime needs to create a project container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Deterministic container name.
    pub name: String,
    /// Image to run.
    pub image: ImageRef,
    /// Bind mounts.
    pub mounts: Vec<BindMount>,
    /// Host port published to the container's service port.
    pub host_port: Option<u16>,
    /// Keep stdin open so commands can be written after start.
    pub interactive: bool,
}

// =============================================================================
// Attach
// =============================================================================

/// Duplex byte stream into a running container.
///
/// `stdin` carries the command payload; `stdout` is read until the job ends.
/// `session` keeps any backing resource (e.g. an attach subprocess) alive for
/// as long as the streams are in use.
pub struct AttachedIo {
    /// Write side: the container's standard input.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Read side: the container's standard output.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Resource tied to the lifetime of the attachment.
    pub session: Option<Box<dyn Any + Send>>,
}

impl std::fmt::Debug for AttachedIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedIo")
            .field("session", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Build
// =============================================================================

/// Captured output of an image build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Whether the build succeeded.
    pub success: bool,
    /// Build log, one entry per line.
    pub log: Vec<String>,
    /// When the build finished.
    pub finished_at: DateTime<Utc>,
}

// =============================================================================
// Container Runtime Trait
// =============================================================================

/// Container runtime interface for one endpoint.
///
/// # Lifecycle
///
/// ```text
/// create(spec) → start(name) → [attach(name)] → stop(name) → remove(name)
/// ```
///
/// # Implementations
///
/// - `DockerCliRuntime`: the `docker` CLI against a local socket or TCP host
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the endpoint this runtime talks to.
    fn endpoint(&self) -> &str;

    /// Checks that the endpoint answers.
    async fn ping(&self) -> Result<()>;

    /// Creates (but does not start) a container. Returns the runtime id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Starts a created container.
    async fn start(&self, name: &str) -> Result<()>;

    /// Stops a running container, killing it after `timeout`.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Removes a container. With `force`, a running container is killed first.
    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    /// Gets the live state of a container.
    async fn state(&self, name: &str) -> Result<ContainerState>;

    /// Attaches to a running container's stdin and stdout.
    async fn attach(&self, name: &str) -> Result<AttachedIo>;

    /// Lists all containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Lists images present on the endpoint.
    async fn list_images(&self) -> Result<Vec<ImageRef>>;

    /// Builds `image` from the build context at `context`.
    ///
    /// A failed build is reported through [`BuildOutput::success`], not as an
    /// error; errors are reserved for failing to run the build at all.
    async fn build_image(&self, image: &ImageRef, context: &Path) -> Result<BuildOutput>;
}
