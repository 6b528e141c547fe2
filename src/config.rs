//! Service configuration.
//!
//! Loaded from a TOML file; every field has a default from
//! [`crate::constants`], so an empty file (or no file) is a valid
//! configuration.
//!
//! ```toml
//! [runtime]
//! endpoints = ["unix:///var/run/docker.sock"]
//! hosts_file = "resources/hosts.txt"
//! stop_timeout_secs = 10
//!
//! [resources]
//! cpu_capacity = 8
//! gpu_capacity = 1
//!
//! [stream]
//! quiescence_ms = 1000
//!
//! [gateway]
//! listen = "0.0.0.0:8085"
//! subscriber_queue = 256
//!
//! [control]
//! listen = "127.0.0.1:8086"
//!
//! [images]
//! catalog_file = "resources/image.txt"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_CONTROL_ADDR, DEFAULT_CPU_CAPACITY, DEFAULT_GPU_CAPACITY, DEFAULT_LISTEN_ADDR, DEFAULT_RUNTIME_ENDPOINT,
    QUIESCENCE_WINDOW, STOP_TIMEOUT, SUBSCRIBER_QUEUE_CAPACITY,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub resources: ResourceConfig,
    pub stream: StreamConfig,
    pub gateway: GatewayConfig,
    pub control: ControlConfig,
    pub images: ImageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Endpoints in the pool.
    pub endpoints: Vec<String>,
    /// Extra endpoints, one per line.
    pub hosts_file: Option<PathBuf>,
    /// Endpoint to prefer when several are reachable.
    pub default_endpoint: Option<String>,
    pub stop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_RUNTIME_ENDPOINT.to_string()],
            hosts_file: None,
            default_endpoint: None,
            stop_timeout_secs: STOP_TIMEOUT.as_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceConfig {
    pub cpu_capacity: u32,
    pub gpu_capacity: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_capacity: DEFAULT_CPU_CAPACITY,
            gpu_capacity: DEFAULT_GPU_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub quiescence_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            quiescence_ms: u64::try_from(QUIESCENCE_WINDOW.as_millis()).unwrap_or(1000),
        }
    }
}

impl StreamConfig {
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub listen: String,
    pub subscriber_queue: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            subscriber_queue: SUBSCRIBER_QUEUE_CAPACITY,
        }
    }
}

/// Where `forgerun serve` accepts commands from the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// Loopback address only.
    pub listen: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_CONTROL_ADDR.to_string(),
        }
    }
}

impl ControlConfig {
    pub fn listen_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        self.listen.parse()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    /// Catalog persisted as one `name:tag` per line.
    pub catalog_file: Option<PathBuf>,
}

impl Config {
    /// Reads and validates a TOML file.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Self::parse(&contents, path)
    }

    /// Parses TOML text. `origin` is only used in error messages.
    pub fn parse(contents: &str, origin: &Path) -> Result<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| Error::Config {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate(origin)?;
        Ok(config)
    }

    fn validate(&self, origin: &Path) -> Result<()> {
        let invalid = |reason: String| Error::Config {
            path: origin.to_path_buf(),
            reason,
        };

        if self.runtime.endpoints.is_empty() && self.runtime.hosts_file.is_none() {
            return Err(invalid(
                "runtime.endpoints is empty and no runtime.hosts_file is set".to_string(),
            ));
        }
        if self.stream.quiescence_ms == 0 {
            return Err(invalid("stream.quiescence_ms must be positive".to_string()));
        }
        if self.gateway.subscriber_queue == 0 {
            return Err(invalid("gateway.subscriber_queue must be positive".to_string()));
        }
        self.gateway.listen_addr().map_err(|e| invalid(e.to_string()))?;
        let control = self
            .control
            .listen_addr()
            .map_err(|e| invalid(format!("control.listen: {e}")))?;
        if !control.ip().is_loopback() {
            return Err(invalid(format!(
                "control.listen must be a loopback address, got {control}"
            )));
        }
        Ok(())
    }
}

impl GatewayConfig {
    pub fn listen_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        self.listen.parse()
    }
}
