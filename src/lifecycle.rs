//! # Container Lifecycle Manager
//!
//! Owns the `project_id → ContainerHandle` map and drives the runtime for
//! create, stop and status.
//!
//! ## Create
//!
//! ```text
//! create(req)
//!   │  per-project lock
//!   ├─ preconditions ── job running? image in catalog?
//!   ├─ ledger.admit_with(demand, previous reservation, preconditions)
//!   │     └─ Rejected(reasons) ──► return, nothing touched
//!   ├─ reconcile ── container named project_<id> exists? force stop + remove
//!   │     └─ failed ──► settle back to previous reservation, Err
//!   ├─ settle to demand, drop previous handle
//!   ├─ runtime.create + runtime.start   (failure: release, remove, Err)
//!   └─ store handle, status → Wait
//! ```
//!
//! A second `create()` for the same project supersedes the first: the old
//! container is torn down by reconciliation and its reservation is credited
//! to the new admission. If the old container cannot be removed, its handle
//! and reservation stay exactly as they were.
//!
//! ## Stop
//!
//! `stop()` cancels any job streaming for the project and waits for its read
//! loop to exit before the container is removed, so no line is published for
//! the project after `stop()` returns. A container that is already gone
//! counts as stopped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{ImageCatalog, ImageRef};
use crate::constants::{
    container_name, project_id_from_name, MODEL_MOUNT, PROJECT_MOUNT, STOP_TIMEOUT,
    TEST_DATASET_MOUNT, TRAIN_DATASET_MOUNT,
};
use crate::error::{Error, Result};
use crate::ledger::{Admission, RejectReason, Reservation, ResourceDemand, ResourceLedger};
use crate::runtime::{BindMount, ContainerRuntime, ContainerSpec, ContainerStatus};
use crate::state::{ProjectStatus, StatusTracker};

// =============================================================================
// Requests and handles
// =============================================================================

/// Host directories bind-mounted into a project container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectMounts {
    pub model: PathBuf,
    pub project: PathBuf,
    pub train_dataset: PathBuf,
    pub test_dataset: PathBuf,
}

impl ProjectMounts {
    /// Conventional layout under one root: `<root>/{model,project,train,test}`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            model: root.join("model"),
            project: root.join("project"),
            train_dataset: root.join("train"),
            test_dataset: root.join("test"),
        }
    }

    /// The four mounts with their fixed in-container targets.
    pub fn bind_mounts(&self) -> Vec<BindMount> {
        [
            (&self.model, MODEL_MOUNT),
            (&self.project, PROJECT_MOUNT),
            (&self.train_dataset, TRAIN_DATASET_MOUNT),
            (&self.test_dataset, TEST_DATASET_MOUNT),
        ]
        .into_iter()
        .map(|(source, target)| BindMount {
            source: source.clone(),
            target: target.to_string(),
            read_only: false,
        })
        .collect()
    }
}

/// Parameters of [`LifecycleManager::create`].
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub project_id: u64,
    pub image: ImageRef,
    pub demand: ResourceDemand,
    pub mounts: ProjectMounts,
    /// Host port published to the container's service port.
    pub host_port: Option<u16>,
}

/// A live container owned by the manager.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerHandle {
    pub project_id: u64,
    pub name: String,
    pub container_id: String,
    pub image: String,
    #[serde(skip)]
    pub reservation: Reservation,
    pub created_at: DateTime<Utc>,
}

/// Result of [`LifecycleManager::create`].
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// Container is up; project is in `Wait`.
    Created(ContainerHandle),
    /// Admission refused. Nothing was reserved or created.
    Rejected(Vec<RejectReason>),
}

impl CreateOutcome {
    #[must_use]
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

// =============================================================================
// Job slots
// =============================================================================

struct JobSlot {
    job_id: u64,
    cancel: CancellationToken,
    done: watch::Receiver<()>,
}

type JobTable = Arc<Mutex<HashMap<u64, JobSlot>>>;

/// Marks a job as active for a project until dropped.
///
/// Holds the job's cancellation token. Dropping the guard frees the slot and
/// wakes any `stop()` waiting for the job to end.
pub struct JobGuard {
    project_id: u64,
    job_id: u64,
    cancel: CancellationToken,
    jobs: JobTable,
    _done: watch::Sender<()>,
}

impl JobGuard {
    /// Token cancelled when the project is stopped.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn project_id(&self) -> u64 {
        self.project_id
    }
}

impl std::fmt::Debug for JobGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobGuard")
            .field("project_id", &self.project_id)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if jobs
            .get(&self.project_id)
            .is_some_and(|slot| slot.job_id == self.job_id)
        {
            jobs.remove(&self.project_id);
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Creates, stops and queries project containers.
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Arc<ImageCatalog>,
    ledger: Arc<ResourceLedger>,
    status: Arc<StatusTracker>,
    handles: RwLock<HashMap<u64, ContainerHandle>>,
    project_locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
    jobs: JobTable,
    next_job_id: std::sync::atomic::AtomicU64,
    stop_timeout: Duration,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("endpoint", &self.runtime.endpoint())
            .field("containers", &self.read_handles().len())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        catalog: Arc<ImageCatalog>,
        ledger: Arc<ResourceLedger>,
        status: Arc<StatusTracker>,
    ) -> Self {
        Self {
            runtime,
            catalog,
            ledger,
            status,
            handles: RwLock::new(HashMap::new()),
            project_locks: Mutex::new(HashMap::new()),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_job_id: std::sync::atomic::AtomicU64::new(1),
            stop_timeout: STOP_TIMEOUT,
        }
    }

    /// Overrides the grace period given to a container on stop.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn catalog(&self) -> &Arc<ImageCatalog> {
        &self.catalog
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn status_tracker(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    /// Current project status.
    pub fn project_status(&self, project_id: u64) -> ProjectStatus {
        self.status.get(project_id)
    }

    fn read_handles(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, ContainerHandle>> {
        self.handles
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_handles(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, ContainerHandle>> {
        self.handles
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<u64, JobSlot>> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn project_lock(&self, project_id: u64) -> Arc<tokio::sync::Mutex<()>> {
        self.project_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(project_id)
            .or_default()
            .clone()
    }

    /// Handle of the project's live container.
    pub fn handle(&self, project_id: u64) -> Option<ContainerHandle> {
        self.read_handles().get(&project_id).cloned()
    }

    /// Handles of all live containers, by project id.
    pub fn handles(&self) -> Vec<ContainerHandle> {
        let mut handles: Vec<_> = self.read_handles().values().cloned().collect();
        handles.sort_by_key(|h| h.project_id);
        handles
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Admits, reconciles, creates and starts the project's container.
    ///
    /// # Errors
    ///
    /// Runtime failures ([`Error::CreateFailed`], [`Error::StartFailed`], or
    /// a failed teardown of a stale container). Admission refusal is not an
    /// error; see [`CreateOutcome::Rejected`].
    pub async fn create(&self, request: CreateRequest) -> Result<CreateOutcome> {
        let project_id = request.project_id;
        let lock = self.project_lock(project_id);
        let _serialized = lock.lock().await;

        let mut preconditions = Vec::new();
        if self.job_active(project_id) {
            preconditions.push(RejectReason::JobInProgress { project_id });
        }
        if !self.catalog.exists(&request.image) {
            preconditions.push(RejectReason::ImageMissing {
                image: request.image.to_string(),
            });
        }

        let previous = self.handle(project_id);
        let held = match self.ledger.admit_with(
            request.demand,
            previous.as_ref().map(|h| h.reservation),
            preconditions,
        ) {
            Admission::Admitted(held) => held,
            Admission::Rejected(reasons) => {
                info!(
                    project = project_id,
                    reasons = ?reasons,
                    "create rejected"
                );
                return Ok(CreateOutcome::Rejected(reasons));
            }
        };

        let name = container_name(project_id);

        // Until the old container is gone, the previous handle and its units
        // stay in place.
        if let Err(e) = self.reconcile(&name).await {
            match &previous {
                Some(prev) => {
                    self.ledger.settle(held, prev.reservation);
                    warn!(
                        project = project_id,
                        container = %name,
                        error = %e,
                        "previous container survived teardown, keeping it"
                    );
                }
                None => self.ledger.release(held),
            }
            return Err(e);
        }

        let reservation = self.ledger.settle(held, request.demand.into());
        if previous.is_some() {
            self.write_handles().remove(&project_id);
        }

        let container_id = match self.launch(&name, &request).await {
            Ok(id) => id,
            Err(e) => {
                self.ledger.release(reservation);
                if previous.is_some() {
                    self.mark_stopped(project_id).await;
                }
                return Err(e);
            }
        };

        let handle = ContainerHandle {
            project_id,
            name: name.clone(),
            container_id,
            image: request.image.to_string(),
            reservation,
            created_at: Utc::now(),
        };
        self.write_handles().insert(project_id, handle.clone());
        self.status.transition(project_id, ProjectStatus::Wait).await?;

        info!(
            project = project_id,
            container = %name,
            image = %request.image,
            cpu = reservation.cpu,
            gpu = reservation.gpu,
            "container created"
        );
        Ok(CreateOutcome::Created(handle))
    }

    async fn launch(&self, name: &str, request: &CreateRequest) -> Result<String> {
        let spec = ContainerSpec {
            name: name.to_string(),
            image: request.image.clone(),
            mounts: request.mounts.bind_mounts(),
            host_port: request.host_port,
            interactive: true,
        };

        let container_id = self.runtime.create(&spec).await?;

        if let Err(e) = self.runtime.start(name).await {
            if let Err(cleanup) = self.runtime.remove(name, true).await {
                warn!(container = %name, error = %cleanup, "cleanup after failed start");
            }
            return Err(e);
        }

        Ok(container_id)
    }

    /// Records `Stopped` after the project's container went away outside
    /// [`stop`](Self::stop).
    async fn mark_stopped(&self, project_id: u64) {
        if let Err(e) = self.status.transition(project_id, ProjectStatus::Stopped).await {
            warn!(project = project_id, error = %e, "status transition skipped");
        }
    }

    /// Removes any container already holding the project's name.
    async fn reconcile(&self, name: &str) -> Result<()> {
        match self.runtime.state(name).await {
            Ok(state) => {
                warn!(
                    container = %name,
                    status = %state.status,
                    "recovered stale container, removing before create"
                );
                self.teardown(name).await
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Force stop and remove. A missing container is fine.
    async fn teardown(&self, name: &str) -> Result<()> {
        match self.runtime.stop(name, self.stop_timeout).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => warn!(container = %name, error = %e, "stop failed, forcing removal"),
        }
        match self.runtime.remove(name, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Stops and removes the project's container and releases its reservation.
    ///
    /// Idempotent: stopping a project with no container, or whose container
    /// has already disappeared, succeeds and leaves it `Stopped`.
    ///
    /// # Errors
    ///
    /// The runtime refused to remove the container. The handle and
    /// reservation are kept so the stop can be retried.
    pub async fn stop(&self, project_id: u64) -> Result<()> {
        self.cancel_job(project_id).await;

        let lock = self.project_lock(project_id);
        let _serialized = lock.lock().await;

        let handle = self.write_handles().remove(&project_id);
        let name = handle
            .as_ref()
            .map_or_else(|| container_name(project_id), |h| h.name.clone());

        if let Err(e) = self.teardown(&name).await {
            if let Some(handle) = handle {
                self.write_handles().insert(project_id, handle);
            }
            return Err(Error::StopFailed {
                id: name,
                reason: e.to_string(),
            });
        }

        if let Some(handle) = &handle {
            self.ledger.release(handle.reservation);
        }
        self.status.transition(project_id, ProjectStatus::Stopped).await?;

        info!(project = project_id, container = %name, had_handle = handle.is_some(), "container stopped");
        Ok(())
    }

    /// Live runtime status of the project's container; `Unknown` if there is
    /// none.
    pub async fn status(&self, project_id: u64) -> Result<ContainerStatus> {
        match self.runtime.state(&container_name(project_id)).await {
            Ok(state) => Ok(state.status),
            Err(e) if e.is_not_found() => Ok(ContainerStatus::Unknown),
            Err(e) => Err(e),
        }
    }

    /// Removes `project_*` containers the manager does not track.
    ///
    /// Run at startup to clear containers left behind by a previous process.
    /// Returns the names removed.
    pub async fn sweep_orphans(&self) -> Result<Vec<String>> {
        let containers = self.runtime.list_containers().await?;
        let mut removed = Vec::new();
        for container in containers {
            let name = container.name.trim_start_matches('/');
            let Some(project_id) = project_id_from_name(name) else {
                continue;
            };
            if self.read_handles().contains_key(&project_id) {
                continue;
            }
            warn!(container = %name, status = %container.status, "recovered orphan container");
            self.teardown(name).await?;
            removed.push(name.to_string());
        }
        Ok(removed)
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Returns true while a job is streaming for the project.
    pub fn job_active(&self, project_id: u64) -> bool {
        self.lock_jobs().contains_key(&project_id)
    }

    /// Claims the project's job slot.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAttached`] if the project has no live container
    /// - [`Error::JobInProgress`] if another job holds the slot
    pub fn begin_job(&self, project_id: u64) -> Result<JobGuard> {
        if !self.read_handles().contains_key(&project_id) {
            return Err(Error::NotAttached(project_id));
        }

        let mut jobs = self.lock_jobs();
        if jobs.contains_key(&project_id) {
            return Err(Error::JobInProgress(project_id));
        }

        let job_id = self
            .next_job_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(());
        jobs.insert(
            project_id,
            JobSlot {
                job_id,
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        debug!(project = project_id, job = job_id, "job slot claimed");

        Ok(JobGuard {
            project_id,
            job_id,
            cancel,
            jobs: Arc::clone(&self.jobs),
            _done: done_tx,
        })
    }

    /// Cancels the project's job, if any, and waits until its guard drops.
    async fn cancel_job(&self, project_id: u64) {
        let slot = self
            .lock_jobs()
            .get(&project_id)
            .map(|slot| (slot.cancel.clone(), slot.done.clone()));

        if let Some((cancel, mut done)) = slot {
            debug!(project = project_id, "cancelling active job");
            cancel.cancel();
            // Resolves with Err once the guard (and its sender) is dropped.
            while done.changed().await.is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_targets() {
        let mounts = ProjectMounts::under("/srv/projects/3").bind_mounts();
        let targets: Vec<_> = mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(
            targets,
            vec![MODEL_MOUNT, PROJECT_MOUNT, TRAIN_DATASET_MOUNT, TEST_DATASET_MOUNT]
        );
        assert_eq!(mounts[2].source, PathBuf::from("/srv/projects/3/train"));
        assert!(mounts.iter().all(|m| !m.read_only));
    }
}
