//! Project status state machine.
//!
//! ```text
//!              create              run               sentinel
//!   ┌──────┐ ────────► ┌──────┐ ────────► ┌─────────┐ ────────► ┌──────┐
//!   │ Init │           │ Wait │           │ Running │           │ Wait │
//!   └──────┘           └──────┘           └────┬────┘           └──────┘
//!       │                  ▲                   │ error / stop
//!       │ stop             │ create            ▼
//!       └─────────────────►┴────────────── ┌─────────┐
//!                                          │ Stopped │
//!                                          └─────────┘
//! ```
//!
//! Any state may move to `Stopped`; `Stopped` is restartable through a new
//! `create()`. `Running` is only reachable from `Wait`. Nothing returns to
//! `Init`.
//!
//! [`StatusTracker`] holds the authoritative in-memory status and reports
//! every accepted transition to the [`ProjectStore`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::persistence::ProjectStore;

/// Externally visible project status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    /// Never run.
    #[default]
    Init,
    /// Container up and idle, ready for a command.
    Wait,
    /// A job is streaming.
    Running,
    /// Container torn down.
    Stopped,
}

impl ProjectStatus {
    /// Returns true if `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match next {
            Self::Init => false,
            Self::Wait | Self::Stopped => true,
            Self::Running => self == Self::Wait,
        }
    }

    /// Persistence string for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Wait => "wait",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative project statuses plus reporting to persistence.
pub struct StatusTracker {
    statuses: RwLock<HashMap<u64, ProjectStatus>>,
    store: Arc<dyn ProjectStore>,
}

impl std::fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTracker").finish_non_exhaustive()
    }
}

impl StatusTracker {
    /// Creates a tracker reporting to `store`.
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// The persistence collaborator.
    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    /// Current status; projects never seen are `Init`.
    pub fn get(&self, project_id: u64) -> ProjectStatus {
        self.statuses
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&project_id)
            .copied()
            .unwrap_or_default()
    }

    /// Moves the project to `next` and reports it.
    ///
    /// The in-memory status is authoritative: a failing store is logged and
    /// does not undo the transition.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] if the state machine forbids the move.
    pub async fn transition(&self, project_id: u64, next: ProjectStatus) -> Result<ProjectStatus> {
        let previous = {
            let mut statuses = self
                .statuses
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let current = statuses.get(&project_id).copied().unwrap_or_default();
            if !current.can_transition_to(next) {
                return Err(Error::InvalidTransition {
                    project_id,
                    from: current,
                    to: next,
                });
            }
            statuses.insert(project_id, next);
            current
        };

        debug!(project = project_id, from = %previous, to = %next, "status transition");

        if let Err(e) = self.store.update_status(project_id, next).await {
            warn!(project = project_id, status = %next, error = %e, "failed to persist status");
        }
        Ok(previous)
    }
}
