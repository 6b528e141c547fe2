//! forgerun - project job runner CLI
//!
//! ## Usage
//!
//! ```sh
//! forgerun serve                               # gateway + control endpoint, hosts all jobs
//! forgerun images [--sync]
//! forgerun build <image> <context-dir>
//! forgerun status <project-id>
//! forgerun run <project-id> --image trainer:v1 --cpu 2 --gpu 1 \
//!     --mounts /srv/projects/7 train --hyperparameters a.json b.json
//! forgerun stop <project-id>
//! ```
//!
//! `serve` is the only process that touches the runtime. It owns the
//! resource ledger, the broadcast hub and the container handles; every
//! other subcommand is a client of its loopback control endpoint
//! (`control.listen`), so capacity limits hold across concurrent jobs and
//! WebSocket observers see every job's output. Run one `serve` per runtime
//! endpoint: at startup it removes `project_*` containers it does not own.
//!
//! Configuration comes from `--config` (TOML, see [`forgerun::config`]).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use forgerun::control::submit;
use forgerun::{
    merge_hyperparameter_files, BroadcastHub, CommandExecutor, CommandKind, Config,
    ControlEvent, ControlRequest, ControlServer, ControlService, Gateway, ImageCatalog,
    LifecycleManager, MemoryProjectStore, ResourceLedger, RuntimePool, StatusTracker,
};

#[derive(Parser)]
#[command(name = "forgerun", version, about = "Per-project ML job containers")]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long, env = "FORGERUN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `forgerun=debug`. `RUST_LOG` wins if set.
    #[arg(long, default_value = "forgerun=info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host jobs: WebSocket gateway plus the control endpoint, until interrupted.
    Serve {
        /// Gateway listen address (overrides gateway.listen).
        #[arg(long)]
        listen: Option<String>,

        /// Runtime endpoint to use instead of the configured preference.
        #[arg(short = 'H', long)]
        endpoint: Option<String>,
    },
    /// List catalog images.
    Images {
        /// Re-read the runtime's images first and persist the catalog.
        #[arg(long)]
        sync: bool,
    },
    /// Build an image from a directory containing a Dockerfile.
    Build { image: String, context: PathBuf },
    /// Show the project's status and its container's live status.
    Status { project_id: u64 },
    /// Create the project container and run one command, printing its output.
    Run {
        project_id: u64,

        #[arg(long)]
        image: String,

        #[arg(long, default_value_t = 1)]
        cpu: u32,

        #[arg(long, default_value_t = 0)]
        gpu: u32,

        /// Root directory holding model/, project/, train/ and test/.
        #[arg(long)]
        mounts: PathBuf,

        /// Host port published to the container's port 80.
        #[arg(long)]
        port: Option<u16>,

        #[arg(value_enum)]
        command: CliCommand,

        /// Raw parameter string for `predict`.
        #[arg(long, default_value = "")]
        params: String,

        /// Hyperparameter JSON files for `train`; later files win.
        #[arg(long, num_args = 1..)]
        hyperparameters: Vec<PathBuf>,

        /// Stop and remove the container when the job ends.
        #[arg(long)]
        stop_after: bool,
    },
    /// Stop and remove a project container, cancelling its job.
    Stop { project_id: u64 },
}

#[derive(Clone, Copy, ValueEnum)]
enum CliCommand {
    Train,
    Predict,
}

impl From<CliCommand> for CommandKind {
    fn from(c: CliCommand) -> Self {
        match c {
            CliCommand::Train => CommandKind::Train,
            CliCommand::Predict => CommandKind::Predict,
        }
    }
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Ok(Config::load(path).await?),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let config = load_config(args.config.as_deref()).await?;
    let control = config
        .control
        .listen_addr()
        .context("invalid control.listen")?;

    let request = match args.command {
        Command::Serve { listen, endpoint } => return serve(config, listen, endpoint).await,
        Command::Images { sync } => ControlRequest::Images { sync },
        Command::Build { image, context } => ControlRequest::Build {
            image,
            context: absolute(&context)?,
        },
        Command::Status { project_id } => ControlRequest::Status { project_id },
        Command::Stop { project_id } => ControlRequest::Stop { project_id },
        Command::Run {
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
            let hyperparameters = if hyperparameters.is_empty() {
                None
            } else {
                Some(merge_hyperparameter_files(&hyperparameters).await?)
            };
            ControlRequest::Run {
                project_id,
                image,
                cpu,
                gpu,
                mounts: absolute(&mounts)?,
                port,
                command: command.into(),
                params,
                hyperparameters,
                stop_after,
            }
        }
    };

    request_and_print(control, &request).await
}

/// Paths travel to the serving process, which may have another working
/// directory.
fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolving {}", path.display()))
}

async fn request_and_print(control: SocketAddr, request: &ControlRequest) -> anyhow::Result<()> {
    let terminal = submit(control, request, |line| println!("{line}")).await?;
    match terminal {
        ControlEvent::Done { message } => {
            println!("{message}");
            Ok(())
        }
        ControlEvent::Rejected { reasons } => {
            for reason in &reasons {
                eprintln!("rejected: {reason}");
            }
            bail!("request was not admitted");
        }
        ControlEvent::Failed { error } => bail!(error),
        ControlEvent::Line { text } => bail!("unexpected final event: {text}"),
    }
}

/// Process-wide state of the serving process.
struct Stack {
    store: Arc<MemoryProjectStore>,
    lifecycle: Arc<LifecycleManager>,
    hub: Arc<BroadcastHub>,
    executor: Arc<CommandExecutor>,
}

impl Stack {
    async fn build(config: &Config, endpoint: Option<&str>) -> anyhow::Result<Self> {
        let mut pool = RuntimePool::from_endpoints(&config.runtime.endpoints)?;
        if let Some(hosts) = &config.runtime.hosts_file {
            match pool.load_hosts_file(hosts).await {
                Ok(added) => info!(path = %hosts.display(), added, "hosts file loaded"),
                Err(e) => warn!(path = %hosts.display(), error = %e, "hosts file not loaded"),
            }
        }
        let preferred = endpoint.or(config.runtime.default_endpoint.as_deref());
        let runtime = pool.select_reachable(preferred).await?;

        let catalog = Arc::new(ImageCatalog::new());
        if let Some(path) = &config.images.catalog_file {
            if path.exists() {
                catalog
                    .load(path)
                    .await
                    .with_context(|| format!("loading image catalog {}", path.display()))?;
            }
        }
        catalog.sync_from(runtime.as_ref()).await?;

        let store = Arc::new(MemoryProjectStore::new());
        let status = Arc::new(StatusTracker::new(store.clone()));
        let ledger = Arc::new(ResourceLedger::new(
            config.resources.cpu_capacity,
            config.resources.gpu_capacity,
        ));
        let lifecycle = Arc::new(
            LifecycleManager::new(runtime, catalog, ledger, status)
                .with_stop_timeout(config.runtime.stop_timeout()),
        );
        let hub = Arc::new(BroadcastHub::new());
        let executor = Arc::new(
            CommandExecutor::new(lifecycle.clone(), hub.clone())
                .with_quiescence(config.stream.quiescence()),
        );

        Ok(Self {
            store,
            lifecycle,
            hub,
            executor,
        })
    }
}

async fn serve(config: Config, listen: Option<String>, endpoint: Option<String>) -> anyhow::Result<()> {
    let gateway_addr: SocketAddr = listen
        .unwrap_or_else(|| config.gateway.listen.clone())
        .parse()
        .context("invalid listen address")?;
    let control_addr = config
        .control
        .listen_addr()
        .context("invalid control.listen")?;

    // Bind before touching containers: a second serve on this host fails
    // here instead of sweeping the first one's containers.
    let control_listener = TcpListener::bind(control_addr)
        .await
        .with_context(|| format!("binding control endpoint {control_addr}"))?;
    let gateway_listener = TcpListener::bind(gateway_addr)
        .await
        .with_context(|| format!("binding gateway {gateway_addr}"))?;

    let stack = Stack::build(&config, endpoint.as_deref()).await?;
    let removed = stack.lifecycle.sweep_orphans().await?;
    if !removed.is_empty() {
        info!(count = removed.len(), "removed orphan containers");
    }

    let service = Arc::new(
        ControlService::new(stack.executor.clone(), stack.store.clone())
            .with_catalog_file(config.images.catalog_file.clone())
            .with_queue_capacity(config.gateway.subscriber_queue),
    );
    let gateway = Gateway::new(stack.hub.clone(), config.gateway.subscriber_queue);
    let control = ControlServer::new(service);

    let shutdown = CancellationToken::new();
    let gateway_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gateway.serve(gateway_listener, shutdown).await })
    };
    let control_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { control.serve(control_listener, shutdown).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    gateway_task.await??;
    control_task.await??;

    for handle in stack.lifecycle.handles() {
        if let Err(e) = stack.lifecycle.stop(handle.project_id).await {
            warn!(project = handle.project_id, error = %e, "stop on shutdown failed");
        }
    }
    if let Some(path) = &config.images.catalog_file {
        if let Err(e) = stack.lifecycle.catalog().save(path).await {
            warn!(path = %path.display(), error = %e, "failed to save image catalog");
        }
    }
    Ok(())
}
