//! Shared fixtures: an in-memory container runtime and a wired-up stack.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use forgerun::{
    AttachedIo, BroadcastHub, BuildOutput, ChannelSubscriber, CommandExecutor, ConnectionId,
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, ContainerSummary,
    CreateRequest, DeliveryError, Error, ImageCatalog, ImageRef, LifecycleManager,
    MemoryProjectStore, OutboundFrame, ProjectMounts, ResourceDemand, ResourceLedger, Result,
    StatusTracker, Subscriber,
};

const PIPE_CAPACITY: usize = 64 * 1024;

pub const IMAGE: &str = "trainer:latest";

// =============================================================================
// In-memory runtime
// =============================================================================

/// Container side of one attach: read what the executor wrote, write output.
pub struct Console {
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
}

impl Console {
    /// Reads until `lines` newline-terminated lines have arrived.
    pub async fn read_lines(&mut self, lines: usize) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while buf.iter().filter(|b| **b == b'\n').count() < lines {
            let n = self.stdin.read(&mut chunk).await.expect("console stdin");
            assert!(n > 0, "stdin closed before {lines} lines");
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(buf).expect("utf-8 invocation")
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.stdout.write_all(bytes).await.expect("console stdout");
        self.stdout.flush().await.expect("console flush");
    }
}

#[derive(Debug)]
struct FakeContainer {
    id: String,
    image: String,
    status: ContainerStatus,
    host_port: Option<u16>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    images: Vec<ImageRef>,
    consoles: HashMap<String, VecDeque<Console>>,
    created: Vec<String>,
    removed: Vec<String>,
    fail_next_create: bool,
    fail_next_start: bool,
    fail_next_build: bool,
    fail_next_remove: bool,
    next_id: u64,
}

/// [`ContainerRuntime`] that keeps containers in memory and connects
/// `attach` to duplex pipes the test drives through [`FakeRuntime::console`].
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    attached: Notify,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            attached: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_image(&self, image: ImageRef) {
        self.lock().images.push(image);
    }

    /// Simulates a container left behind by an earlier process.
    pub fn inject_container(&self, name: &str, status: ContainerStatus) {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("stale{}", state.next_id);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                id,
                image: IMAGE.to_string(),
                status,
                host_port: None,
            },
        );
    }

    pub fn fail_next_create(&self) {
        self.lock().fail_next_create = true;
    }

    pub fn fail_next_start(&self) {
        self.lock().fail_next_start = true;
    }

    pub fn fail_next_build(&self) {
        self.lock().fail_next_build = true;
    }

    pub fn fail_next_remove(&self) {
        self.lock().fail_next_remove = true;
    }

    /// Names of containers currently present.
    pub fn live(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn container_id(&self, name: &str) -> Option<String> {
        self.lock().containers.get(name).map(|c| c.id.clone())
    }

    pub fn host_port(&self, name: &str) -> Option<u16> {
        self.lock().containers.get(name).and_then(|c| c.host_port)
    }

    /// Every successful create, in order.
    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    /// Every successful remove, in order.
    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    /// Waits for the next attach to `name` and returns its container side.
    pub async fn console(&self, name: &str) -> Console {
        loop {
            let notified = self.attached.notified();
            if let Some(console) = self
                .lock()
                .consoles
                .get_mut(name)
                .and_then(VecDeque::pop_front)
            {
                return console;
            }
            tokio::time::timeout(Duration::from_secs(30), notified)
                .await
                .expect("no attach within 30s");
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn endpoint(&self) -> &str {
        "memory://fake"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_create) {
            return Err(Error::CreateFailed {
                id: spec.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        if state.containers.contains_key(&spec.name) {
            return Err(Error::CreateFailed {
                id: spec.name.clone(),
                reason: "Conflict. The container name is already in use".to_string(),
            });
        }
        if !state.images.contains(&spec.image) {
            return Err(Error::CreateFailed {
                id: spec.name.clone(),
                reason: format!("No such image: {}", spec.image),
            });
        }
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                image: spec.image.to_string(),
                status: ContainerStatus::Created,
                host_port: spec.host_port,
            },
        );
        state.created.push(spec.name.clone());
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_start) {
            return Err(Error::StartFailed {
                id: name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        container.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_remove) {
            return Err(Error::DeleteFailed {
                id: name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        if state.containers.remove(name).is_none() {
            return Err(Error::ContainerNotFound(name.to_string()));
        }
        state.consoles.remove(name);
        state.removed.push(name.to_string());
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<ContainerState> {
        let state = self.lock();
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        Ok(ContainerState::new(name, container.status))
    }

    async fn attach(&self, name: &str) -> Result<AttachedIo> {
        let mut state = self.lock();
        let container = state
            .containers
            .get(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        if container.status != ContainerStatus::Running {
            return Err(Error::AttachFailed {
                id: name.to_string(),
                reason: format!("container is {}", container.status),
            });
        }

        let (stdin_w, stdin_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        state
            .consoles
            .entry(name.to_string())
            .or_default()
            .push_back(Console {
                stdin: stdin_r,
                stdout: stdout_w,
            });
        drop(state);

        self.attached.notify_waiters();
        Ok(AttachedIo {
            stdin: Box::new(stdin_w),
            stdout: Box::new(stdout_r),
            session: None,
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let state = self.lock();
        let mut list: Vec<_> = state
            .containers
            .iter()
            .map(|(name, c)| ContainerSummary {
                id: c.id.clone(),
                name: name.clone(),
                image: c.image.clone(),
                status: c.status,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn list_images(&self) -> Result<Vec<ImageRef>> {
        Ok(self.lock().images.clone())
    }

    async fn build_image(&self, image: &ImageRef, _context: &Path) -> Result<BuildOutput> {
        let mut state = self.lock();
        let mut log: Vec<String> = (1..=30).map(|i| format!("Step {i}/30")).collect();
        if std::mem::take(&mut state.fail_next_build) {
            log.push("ERROR: pip install failed".to_string());
            return Ok(BuildOutput {
                success: false,
                log,
                finished_at: Utc::now(),
            });
        }
        log.push(format!("Successfully tagged {image}"));
        state.images.push(image.clone());
        Ok(BuildOutput {
            success: true,
            log,
            finished_at: Utc::now(),
        })
    }
}

// =============================================================================
// Subscribers
// =============================================================================

/// Subscriber whose connection is already gone.
pub struct DeadSubscriber {
    id: ConnectionId,
}

impl DeadSubscriber {
    pub fn new() -> Self {
        Self {
            id: ConnectionId::next(),
        }
    }
}

impl Subscriber for DeadSubscriber {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn deliver(&self, _frame: &OutboundFrame) -> std::result::Result<(), DeliveryError> {
        Err(DeliveryError::Closed)
    }
}

/// Drains everything currently queued, returning log messages only.
pub fn drain_log_lines(rx: &mut tokio::sync::mpsc::Receiver<OutboundFrame>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Log(log) = frame {
            lines.push(log.message);
        }
    }
    lines
}

// =============================================================================
// Wired stack
// =============================================================================

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<MemoryProjectStore>,
    pub ledger: Arc<ResourceLedger>,
    pub lifecycle: Arc<LifecycleManager>,
    pub hub: Arc<BroadcastHub>,
    pub executor: Arc<CommandExecutor>,
}

impl Harness {
    /// Stack with `trainer:latest` on the runtime and in the catalog.
    pub fn new(cpu_capacity: u32, gpu_capacity: u32) -> Self {
        let runtime = Arc::new(FakeRuntime::new());
        let image = ImageRef::parse(IMAGE).unwrap();
        runtime.add_image(image.clone());

        let catalog = Arc::new(ImageCatalog::with_images([image]));
        let store = Arc::new(MemoryProjectStore::new());
        let status = Arc::new(StatusTracker::new(store.clone()));
        let ledger = Arc::new(ResourceLedger::new(cpu_capacity, gpu_capacity));
        let lifecycle = Arc::new(LifecycleManager::new(
            runtime.clone(),
            catalog,
            ledger.clone(),
            status,
        ));
        let hub = Arc::new(BroadcastHub::new());
        let executor = Arc::new(
            CommandExecutor::new(lifecycle.clone(), hub.clone())
                .with_quiescence(Duration::from_secs(1)),
        );

        Self {
            runtime,
            store,
            ledger,
            lifecycle,
            hub,
            executor,
        }
    }

    pub fn request(&self, project_id: u64, cpu: u32, gpu: u32) -> CreateRequest {
        CreateRequest {
            project_id,
            image: ImageRef::parse(IMAGE).unwrap(),
            demand: ResourceDemand::new(cpu, gpu),
            mounts: ProjectMounts::under(format!("/srv/projects/{project_id}")),
            host_port: None,
        }
    }

    /// Creates the project's container, panicking on rejection.
    pub async fn create(&self, project_id: u64) {
        let outcome = self
            .lifecycle
            .create(self.request(project_id, 1, 0))
            .await
            .unwrap();
        assert!(outcome.is_created(), "unexpected outcome: {outcome:?}");
    }

    /// Subscribes a fresh queue to the project's channel.
    pub fn watch(&self, project_id: u64) -> tokio::sync::mpsc::Receiver<OutboundFrame> {
        let (sub, rx) = ChannelSubscriber::pair(1024);
        self.hub.subscribe(Arc::new(sub), &project_id.to_string());
        rx
    }
}
