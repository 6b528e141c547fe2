//! Error types for the job runtime layer.
//!
//! Admission rejections are deliberately absent: a rejected `create()` is a
//! normal outcome ([`crate::lifecycle::CreateOutcome::Rejected`]), and a
//! failed delivery to one subscriber is contained inside the hub
//! ([`crate::hub::DeliveryError`]).

use std::path::PathBuf;

use crate::state::ProjectStatus;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing project containers and jobs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container not found in the runtime.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container create failed.
    #[error("failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Container stop failed.
    #[error("failed to stop container '{id}': {reason}")]
    StopFailed { id: String, reason: String },

    /// Container removal failed.
    #[error("failed to remove container '{id}': {reason}")]
    DeleteFailed { id: String, reason: String },

    /// Attaching to the container's standard streams failed.
    #[error("failed to attach to container '{id}': {reason}")]
    AttachFailed { id: String, reason: String },

    /// A runtime command did not finish in time.
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Runtime query (inspect, list) failed.
    #[error("runtime query failed on {endpoint}: {reason}")]
    QueryFailed { endpoint: String, reason: String },

    // =========================================================================
    // Project / Job Errors
    // =========================================================================
    /// No live, attachable container is registered for the project.
    #[error("project {0} has no attached container")]
    NotAttached(u64),

    /// A job is already streaming for the project.
    #[error("project {0} already has a job in progress")]
    JobInProgress(u64),

    /// The job was cancelled by an explicit stop.
    #[error("job for project {0} was cancelled by stop")]
    JobCancelled(u64),

    /// The output stream ended abnormally; the container has been stopped.
    #[error("job for project {project_id} terminated: {reason}")]
    StreamTerminated { project_id: u64, reason: String },

    /// Status change not permitted by the project state machine.
    #[error("project {project_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        project_id: u64,
        from: ProjectStatus,
        to: ProjectStatus,
    },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image already present; build refused.
    #[error("image already exists: {0}")]
    ImageAlreadyExists(String),

    /// Image build failed. Carries the tail of the build log.
    #[error("failed to build image '{reference}': {}", .log_tail.join("\n"))]
    ImageBuildFailed {
        reference: String,
        log_tail: Vec<String>,
    },

    // =========================================================================
    // Collaborator / Configuration Errors
    // =========================================================================
    /// No runtime endpoint is configured or reachable.
    #[error("no runtime endpoint available: {0}")]
    NoRuntimeEndpoint(String),

    /// Persistence collaborator failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Invalid configuration file.
    #[error("invalid configuration at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// The serving process could not be reached or broke off a request.
    #[error("control endpoint {addr}: {reason}")]
    Control { addr: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Returns true if the error means the container does not exist.
    ///
    /// Stop and remove treat this as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_))
    }
}
