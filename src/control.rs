//! # Control Endpoint
//!
//! Loopback command channel of `forgerun serve`. Every job runs inside the
//! serving process, against its one ledger, hub and lifecycle manager; CLI
//! invocations are clients that submit a request here and print the events
//! that come back.
//!
//! ```text
//!   forgerun run ──ws──► ControlServer ──► ControlService::handle
//!        ▲                                   ├─ lifecycle.create
//!        │  Line* then Done|Rejected|Failed  ├─ hub.subscribe (forwarder)
//!        └───────────────────────────────────└─ executor.run
//! ```
//!
//! One request per connection. A client that disconnects mid-job does not
//! stop the job; `forgerun stop` does.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ImageRef;
use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, CommandKind};
use crate::hub::{ChannelSubscriber, Subscriber};
use crate::ledger::ResourceDemand;
use crate::lifecycle::{CreateOutcome, CreateRequest, ProjectMounts};
use crate::persistence::{Hyperparameters, MemoryProjectStore};
use crate::protocol::OutboundFrame;

const EVENT_QUEUE: usize = 64;

// =============================================================================
// Wire types
// =============================================================================

/// A command submitted by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Create the project container and run one command in it.
    Run {
        project_id: u64,
        image: String,
        cpu: u32,
        gpu: u32,
        /// Root holding model/, project/, train/ and test/.
        mounts: PathBuf,
        #[serde(default)]
        port: Option<u16>,
        command: CommandKind,
        #[serde(default)]
        params: String,
        /// Merged hyperparameters recorded for the project before a train.
        #[serde(default)]
        hyperparameters: Option<Hyperparameters>,
        #[serde(default)]
        stop_after: bool,
    },
    Stop {
        project_id: u64,
    },
    Status {
        project_id: u64,
    },
    Images {
        #[serde(default)]
        sync: bool,
    },
    Build {
        image: String,
        context: PathBuf,
    },
}

/// Progress and result of a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    /// One line of output: a job log line, a build log line, an image.
    Line { text: String },
    /// The request succeeded.
    Done { message: String },
    /// Admission refused the project.
    Rejected { reasons: Vec<String> },
    /// The request failed.
    Failed { error: String },
}

impl ControlEvent {
    /// True for the last event of a request.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Line { .. })
    }

    fn line(text: impl Into<String>) -> Self {
        Self::Line { text: text.into() }
    }

    fn done(message: impl Into<String>) -> Self {
        Self::Done {
            message: message.into(),
        }
    }

    fn failed(error: &Error) -> Self {
        Self::Failed {
            error: error.to_string(),
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Executes control requests against the serving process's shared state.
#[derive(Debug)]
pub struct ControlService {
    executor: Arc<CommandExecutor>,
    store: Arc<MemoryProjectStore>,
    catalog_file: Option<PathBuf>,
    queue_capacity: usize,
}

impl ControlService {
    pub fn new(executor: Arc<CommandExecutor>, store: Arc<MemoryProjectStore>) -> Self {
        Self {
            executor,
            store,
            catalog_file: None,
            queue_capacity: crate::constants::SUBSCRIBER_QUEUE_CAPACITY,
        }
    }

    /// Persists the catalog here after `images --sync` and `build`.
    #[must_use]
    pub fn with_catalog_file(mut self, path: Option<PathBuf>) -> Self {
        self.catalog_file = path;
        self
    }

    /// Queue size of the log forwarder used by `run`.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Handles one request, sending every event to `events`. The last event
    /// sent is terminal.
    pub async fn handle(&self, request: ControlRequest, events: &mpsc::Sender<ControlEvent>) {
        let terminal = match request {
            ControlRequest::Run {
                project_id,
                image,
                cpu,
                gpu,
                mounts,
                port,
                command,
                params,
                hyperparameters,
                stop_after,
            } => {
                let setup = ImageRef::parse(&image).map(|image| CreateRequest {
                    project_id,
                    image,
                    demand: ResourceDemand::new(cpu, gpu),
                    mounts: ProjectMounts::under(mounts),
                    host_port: port,
                });
                match setup {
                    Ok(create) => {
                        if let Some(record) = hyperparameters {
                            self.store.add_hyperparameters(project_id, record);
                        }
                        self.run(create, command, &params, stop_after, events).await
                    }
                    Err(e) => ControlEvent::failed(&e),
                }
            }
            ControlRequest::Stop { project_id } => {
                match self.executor.lifecycle().stop(project_id).await {
                    Ok(()) => ControlEvent::done(format!("project {project_id}: stopped")),
                    Err(e) => ControlEvent::failed(&e),
                }
            }
            ControlRequest::Status { project_id } => {
                let lifecycle = self.executor.lifecycle();
                match lifecycle.status(project_id).await {
                    Ok(container) => ControlEvent::done(format!(
                        "project {project_id}: {} (container {container})",
                        lifecycle.project_status(project_id)
                    )),
                    Err(e) => ControlEvent::failed(&e),
                }
            }
            ControlRequest::Images { sync } => self.images(sync, events).await,
            ControlRequest::Build { image, context } => self.build(&image, context, events).await,
        };
        send(events, terminal).await;
    }

    async fn run(
        &self,
        create: CreateRequest,
        command: CommandKind,
        params: &str,
        stop_after: bool,
        events: &mpsc::Sender<ControlEvent>,
    ) -> ControlEvent {
        let project_id = create.project_id;
        let lifecycle = self.executor.lifecycle();

        match lifecycle.create(create).await {
            Ok(CreateOutcome::Created(handle)) => {
                send(events, ControlEvent::line(format!("container {} ready", handle.name))).await;
            }
            Ok(CreateOutcome::Rejected(reasons)) => {
                return ControlEvent::Rejected {
                    reasons: reasons.iter().map(ToString::to_string).collect(),
                };
            }
            Err(e) => return ControlEvent::failed(&e),
        }

        // Observe the channel like any other subscriber.
        let hub = self.executor.hub();
        let (subscriber, mut frames) = ChannelSubscriber::pair(self.queue_capacity);
        let subscriber_id = subscriber.id();
        hub.subscribe(Arc::new(subscriber), &project_id.to_string());
        let forward = {
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(frame) = frames.recv().await {
                    if let OutboundFrame::Log(log) = frame {
                        send(&events, ControlEvent::line(log.message)).await;
                    }
                }
            })
        };

        let result = self.executor.run(project_id, command, params).await;

        hub.unsubscribe_all(subscriber_id);
        if let Err(e) = forward.await {
            warn!(project = project_id, error = %e, "log forwarder failed");
        }

        match result {
            Ok(outcome) => {
                if stop_after {
                    if let Err(e) = lifecycle.stop(project_id).await {
                        return ControlEvent::failed(&e);
                    }
                }
                ControlEvent::done(format!("{} ({} lines)", outcome.message, outcome.lines))
            }
            Err(e) => ControlEvent::failed(&e),
        }
    }

    async fn images(&self, sync: bool, events: &mpsc::Sender<ControlEvent>) -> ControlEvent {
        let lifecycle = self.executor.lifecycle();
        if sync {
            let runtime = lifecycle.runtime();
            if let Err(e) = lifecycle.catalog().sync_from(runtime.as_ref()).await {
                return ControlEvent::failed(&e);
            }
            self.save_catalog().await;
        }
        let images = lifecycle.catalog().list();
        let count = images.len();
        for image in images {
            send(events, ControlEvent::line(image.to_string())).await;
        }
        ControlEvent::done(format!("{count} images"))
    }

    async fn build(
        &self,
        image: &str,
        context: PathBuf,
        events: &mpsc::Sender<ControlEvent>,
    ) -> ControlEvent {
        let image = match ImageRef::parse(image) {
            Ok(image) => image,
            Err(e) => return ControlEvent::failed(&e),
        };
        let lifecycle = self.executor.lifecycle();
        let report = lifecycle
            .catalog()
            .build(lifecycle.runtime().as_ref(), &image, &context)
            .await;
        match report {
            Ok(report) => {
                for line in report.log_tail {
                    send(events, ControlEvent::line(line)).await;
                }
                self.save_catalog().await;
                ControlEvent::done(format!("built {}", report.image))
            }
            Err(e) => ControlEvent::failed(&e),
        }
    }

    async fn save_catalog(&self) {
        if let Some(path) = &self.catalog_file {
            if let Err(e) = self.executor.lifecycle().catalog().save(path).await {
                warn!(path = %path.display(), error = %e, "failed to save image catalog");
            }
        }
    }
}

async fn send(events: &mpsc::Sender<ControlEvent>, event: ControlEvent) {
    if events.send(event).await.is_err() {
        debug!("control client gone, event dropped");
    }
}

// =============================================================================
// Server
// =============================================================================

/// Accepts control connections until shutdown.
#[derive(Debug, Clone)]
pub struct ControlServer {
    service: Arc<ControlService>,
}

impl ControlServer {
    pub fn new(service: Arc<ControlService>) -> Self {
        Self { service }
    }

    /// Serves clients from an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %listener.local_addr()?, "control endpoint listening");
        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "control accept failed");
                        continue;
                    }
                },
            };
            if !peer.ip().is_loopback() {
                warn!(%peer, "refusing non-loopback control client");
                continue;
            }

            let service = Arc::clone(&self.service);
            tokio::spawn(async move { handle_connection(service, stream, peer).await });
        }
        info!("control endpoint stopped");
        Ok(())
    }
}

async fn handle_connection(service: Arc<ControlService>, stream: TcpStream, peer: SocketAddr) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "control handshake failed");
            return;
        }
    };
    let (mut writer, mut reader) = ws.split();

    let request = loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<ControlRequest>(&text),
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(%peer, error = %e, "control read failed");
                return;
            }
        }
    };

    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE);
    match request {
        Ok(request) => {
            debug!(%peer, ?request, "control request");
            tokio::spawn(async move { service.handle(request, &tx).await });
        }
        Err(e) => {
            send(&tx, ControlEvent::failed(&Error::from(e))).await;
            drop(tx);
        }
    }

    // The service keeps running if the client goes away; only delivery stops.
    while let Some(event) = rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode control event");
                continue;
            }
        };
        if writer.send(Message::Text(text)).await.is_err() {
            break;
        }
        if event.is_terminal() {
            break;
        }
    }
    let _ = writer.close().await;
}

// =============================================================================
// Client
// =============================================================================

/// Submits `request` to the serving process at `addr`.
///
/// Calls `on_line` for every [`ControlEvent::Line`] and returns the terminal
/// event.
///
/// # Errors
///
/// [`Error::Control`] if the endpoint cannot be reached or the connection
/// ends before a terminal event.
pub async fn submit(
    addr: SocketAddr,
    request: &ControlRequest,
    mut on_line: impl FnMut(&str),
) -> Result<ControlEvent> {
    let control_error = |reason: String| Error::Control {
        addr: addr.to_string(),
        reason,
    };

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .map_err(|e| control_error(format!("{e} (is `forgerun serve` running?)")))?;
    ws.send(Message::Text(serde_json::to_string(request)?))
        .await
        .map_err(|e| control_error(e.to_string()))?;

    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| control_error(e.to_string()))?;
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ControlEvent>(&text)? {
            ControlEvent::Line { text } => on_line(&text),
            terminal => {
                let _ = ws.close(None).await;
                return Ok(terminal);
            }
        }
    }
    Err(control_error("connection closed before the request finished".to_string()))
}
