//! # Runtime Constants
//!
//! Resource bounds, timeouts, naming rules and the in-container contract
//! shared by every component. Values here are defaults; [`crate::config`]
//! overrides the tunable ones.
//!
//! ## Cross-References
//!
//! - [`crate::lifecycle`]: container naming, mount targets, stop timeout
//! - [`crate::stream`]: quiescence window, read chunk size
//! - [`crate::executor`]: sentinels and command tokens
//! - [`crate::hub`]: subscriber queue depth
//! - [`crate::catalog`]: image reference limits

use std::time::Duration;

// =============================================================================
// Container Naming
// =============================================================================

/// Prefix of every project container name (`project_<id>`).
pub const CONTAINER_NAME_PREFIX: &str = "project_";

/// Derives the deterministic container name for a project.
#[must_use]
pub fn container_name(project_id: u64) -> String {
    format!("{CONTAINER_NAME_PREFIX}{project_id}")
}

/// Parses a project id back out of a container name.
///
/// Returns `None` for names not produced by [`container_name`].
#[must_use]
pub fn project_id_from_name(name: &str) -> Option<u64> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let id: u64 = name.strip_prefix(CONTAINER_NAME_PREFIX)?.parse().ok()?;
    // Only the canonical spelling names a project: no sign, no padding.
    (container_name(id) == name).then_some(id)
}

// =============================================================================
// In-Container Contract
// =============================================================================

/// Mount target for the model code.
pub const MODEL_MOUNT: &str = "/app/model";

/// Mount target for the project workspace.
pub const PROJECT_MOUNT: &str = "/app/Project";

/// Mount target for the training dataset.
pub const TRAIN_DATASET_MOUNT: &str = "/app/Train_Dataset";

/// Mount target for the test dataset.
pub const TEST_DATASET_MOUNT: &str = "/app/Test_Dataset";

/// Port the in-container service listens on.
pub const CONTAINER_PORT: u16 = 80;

/// Printed by the container when a training run finishes.
pub const TRAIN_SENTINEL: &str = "TRAIN_COMPLETE";

/// Printed by the container when a prediction run finishes.
pub const PREDICT_SENTINEL: &str = "PREDICT_COMPLETE";

// =============================================================================
// Streaming
// =============================================================================

/// Maximum wait for more output before a partial line is flushed.
pub const QUIESCENCE_WINDOW: Duration = Duration::from_secs(1);

/// Read buffer size for the container output stream.
pub const READ_CHUNK_SIZE: usize = 8192;

/// Per-subscriber outbound queue depth.
///
/// A subscriber whose queue is full is treated as dead and dropped, so a
/// stalled client never holds up the rest of its channel.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// Timeouts
// =============================================================================

/// Grace period given to `docker stop` before the runtime kills the container.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for runtime reachability checks.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single runtime CLI call (create, inspect, list...).
///
/// Image builds and stop grace periods are not bounded by this.
pub const RUNTIME_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum captured stdout/stderr of a runtime CLI call.
pub const MAX_COMMAND_OUTPUT: usize = 4 * 1024 * 1024;

// =============================================================================
// Images
// =============================================================================

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Tag assumed when an image reference has none.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Number of build-log lines returned when a build fails.
pub const BUILD_LOG_TAIL_LINES: usize = 20;

// =============================================================================
// Defaults
// =============================================================================

/// Runtime endpoint used when nothing is configured.
pub const DEFAULT_RUNTIME_ENDPOINT: &str = "unix:///var/run/docker.sock";

/// Default gateway listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8085";

/// Default control endpoint address. Must be loopback.
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:8086";

/// Default CPU capacity of the ledger.
pub const DEFAULT_CPU_CAPACITY: u32 = 8;

/// Default GPU capacity of the ledger.
pub const DEFAULT_GPU_CAPACITY: u32 = 1;
