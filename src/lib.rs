//! # forgerun
//!
//! **Per-project ML job containers with admission control and live log fan-out**
//!
//! Runs training and prediction jobs inside one container per project,
//! streams the container's output line by line to every observer of the
//! project's channel, and keeps concurrent jobs within a fixed CPU/GPU
//! budget.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             forgerun                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   run(project, train|predict, params)                               │
//! │        │                                                            │
//! │  ┌─────▼──────────────┐  attach / write   ┌──────────────────────┐  │
//! │  │  CommandExecutor   │ ────────────────► │  project_<id>        │  │
//! │  │  LogLines framing  │ ◄──────────────── │  container stdout    │  │
//! │  └─────┬──────────┬───┘     bytes         └──────────▲───────────┘  │
//! │        │ lines    │ status                           │              │
//! │  ┌─────▼──────┐ ┌─▼─────────────┐        ┌───────────┴───────────┐  │
//! │  │ Broadcast  │ │ StatusTracker │ ◄───── │   LifecycleManager    │  │
//! │  │    Hub     │ │ init/wait/    │        │ admit → reconcile →   │  │
//! │  │ per-channel│ │ running/      │        │ create → start        │  │
//! │  │  fan-out   │ │ stopped       │        └───┬──────────────┬────┘  │
//! │  └─────▲──────┘ └───────┬───────┘            │              │       │
//! │        │                │               ┌────▼─────┐  ┌─────▼────┐  │
//! │  ┌─────┴──────┐  ┌──────▼───────┐       │ Resource │  │  Image   │  │
//! │  │  Gateway   │  │ ProjectStore │       │  Ledger  │  │ Catalog  │  │
//! │  │ (WebSocket)│  │ (persistence)│       └──────────┘  └──────────┘  │
//! │  └────────────┘  └──────────────┘                                   │
//! │  ControlServer (loopback): CLI requests run in this one process     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                       Runtime Backends                              │
//! │        RuntimePool ──► DockerCliRuntime (docker -H <endpoint>)      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Project Lifecycle
//!
//! ```text
//!   Init ──create──► Wait ──run──► Running ──sentinel──► Wait
//!                     ▲                │
//!                     │             error/stop
//!                  create              ▼
//!                     └──────────── Stopped
//! ```
//!
//! # Guarantees
//!
//! - **Capacity**: `used ≤ capacity` for CPU and GPU at every instant; the
//!   check and the reservation are one critical section.
//! - **One container per project**: `create()` is serialized per project and
//!   removes any container already holding the name before creating.
//! - **Ordered logs**: lines reach each subscriber in production order.
//! - **Fault isolation**: a dead or slow subscriber is dropped without
//!   affecting the rest of the channel.
//! - **Clean stop**: after `stop()` returns, nothing more is published for
//!   the project.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use forgerun::*;
//!
//! #[tokio::main]
//! async fn main() -> forgerun::Result<()> {
//!     let runtime = RuntimePool::from_endpoints(["unix:///var/run/docker.sock"])?
//!         .select_reachable(None)
//!         .await?;
//!     let catalog = Arc::new(ImageCatalog::new());
//!     catalog.sync_from(runtime.as_ref()).await?;
//!
//!     let status = Arc::new(StatusTracker::new(Arc::new(MemoryProjectStore::new())));
//!     let lifecycle = Arc::new(LifecycleManager::new(
//!         runtime,
//!         catalog,
//!         Arc::new(ResourceLedger::new(8, 1)),
//!         status,
//!     ));
//!     let executor = CommandExecutor::new(lifecycle.clone(), Arc::new(BroadcastHub::new()));
//!
//!     lifecycle
//!         .create(CreateRequest {
//!             project_id: 7,
//!             image: ImageRef::parse("trainer:latest")?,
//!             demand: ResourceDemand::new(2, 1),
//!             mounts: ProjectMounts::under("/srv/projects/7"),
//!             host_port: None,
//!         })
//!         .await?;
//!     let outcome = executor.run(7, CommandKind::Train, "").await?;
//!     println!("{}", outcome.message);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod constants;
pub mod control;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod hub;
pub mod ledger;
pub mod lifecycle;
pub mod persistence;
pub mod protocol;
pub mod runtime;
pub mod state;
pub mod stream;

pub mod runtimes;

// Re-exports
pub use catalog::{BuildReport, ImageCatalog, ImageRef};
pub use config::Config;
pub use control::{ControlEvent, ControlRequest, ControlServer, ControlService};
pub use error::{Error, Result};
pub use executor::{encode_invocation, CommandExecutor, CommandKind, JobOutcome};
pub use gateway::Gateway;
pub use hub::{BroadcastHub, ChannelSubscriber, ConnectionId, DeliveryError, Subscriber};
pub use ledger::{Admission, LedgerSnapshot, RejectReason, Reservation, ResourceDemand, ResourceLedger};
pub use lifecycle::{ContainerHandle, CreateOutcome, CreateRequest, JobGuard, LifecycleManager, ProjectMounts};
pub use persistence::{merge_hyperparameter_files, Hyperparameters, MemoryProjectStore, ProjectStore};
pub use protocol::{AckFrame, InboundFrame, LogFrame, OutboundFrame, RelayFrame};
pub use runtime::{
    AttachedIo, BindMount, BuildOutput, ContainerRuntime, ContainerSpec, ContainerState,
    ContainerStatus, ContainerSummary,
};
pub use runtimes::{DockerCliRuntime, RuntimePool};
pub use state::{ProjectStatus, StatusTracker};
pub use stream::{LineFramer, LogEvent, LogLines, Utf8Decoder};
