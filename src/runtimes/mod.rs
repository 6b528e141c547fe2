//! Container runtime backends and the endpoint pool.
//!
//! A deployment talks to one runtime endpoint at a time, chosen from a pool
//! built from the configuration and an optional hosts file (one endpoint per
//! line).

pub mod docker;

pub use self::docker::{normalize_endpoint, DockerCliRuntime};

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;

/// Pool of runtime endpoints.
#[derive(Default)]
pub struct RuntimePool {
    runtimes: Vec<Arc<dyn ContainerRuntime>>,
}

impl std::fmt::Debug for RuntimePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePool")
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

impl RuntimePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool of [`DockerCliRuntime`]s, skipping duplicates.
    pub fn from_endpoints<I, S>(endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pool = Self::new();
        for endpoint in endpoints {
            pool.add_endpoint(endpoint.as_ref())?;
        }
        Ok(pool)
    }

    /// Adds a Docker endpoint. Returns false if it was already present.
    pub fn add_endpoint(&mut self, endpoint: &str) -> Result<bool> {
        let runtime = DockerCliRuntime::new(endpoint)?;
        Ok(self.add(Arc::new(runtime)))
    }

    /// Adds a runtime. Returns false if its endpoint was already present.
    pub fn add(&mut self, runtime: Arc<dyn ContainerRuntime>) -> bool {
        if self.get(runtime.endpoint()).is_some() {
            return false;
        }
        debug!(endpoint = runtime.endpoint(), "runtime endpoint added");
        self.runtimes.push(runtime);
        true
    }

    /// Returns all registered runtimes.
    pub fn all(&self) -> &[Arc<dyn ContainerRuntime>] {
        &self.runtimes
    }

    /// Endpoint strings, in insertion order.
    pub fn endpoints(&self) -> Vec<String> {
        self.runtimes
            .iter()
            .map(|r| r.endpoint().to_string())
            .collect()
    }

    /// Gets a runtime by endpoint.
    pub fn get(&self, endpoint: &str) -> Option<Arc<dyn ContainerRuntime>> {
        let wanted = normalize_endpoint(endpoint).unwrap_or_else(|_| endpoint.to_string());
        self.runtimes
            .iter()
            .find(|r| r.endpoint() == wanted)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    /// Picks `preferred` if it is in the pool, else the first endpoint.
    pub fn select(&self, preferred: Option<&str>) -> Result<Arc<dyn ContainerRuntime>> {
        if let Some(endpoint) = preferred {
            if let Some(runtime) = self.get(endpoint) {
                return Ok(runtime);
            }
            warn!(endpoint, "preferred endpoint not in pool");
        }
        self.runtimes
            .first()
            .cloned()
            .ok_or_else(|| Error::NoRuntimeEndpoint("pool is empty".to_string()))
    }

    /// Picks the first endpoint that answers a ping, trying `preferred` first.
    pub async fn select_reachable(
        &self,
        preferred: Option<&str>,
    ) -> Result<Arc<dyn ContainerRuntime>> {
        let mut candidates: Vec<Arc<dyn ContainerRuntime>> = Vec::new();
        if let Some(runtime) = preferred.and_then(|p| self.get(p)) {
            candidates.push(runtime);
        }
        for runtime in &self.runtimes {
            if !candidates.iter().any(|c| c.endpoint() == runtime.endpoint()) {
                candidates.push(Arc::clone(runtime));
            }
        }

        let mut failures = Vec::new();
        for runtime in candidates {
            match runtime.ping().await {
                Ok(()) => {
                    info!(endpoint = runtime.endpoint(), "using runtime endpoint");
                    return Ok(runtime);
                }
                Err(e) => {
                    warn!(endpoint = runtime.endpoint(), error = %e, "endpoint unreachable");
                    failures.push(format!("{}: {e}", runtime.endpoint()));
                }
            }
        }

        if failures.is_empty() {
            Err(Error::NoRuntimeEndpoint("pool is empty".to_string()))
        } else {
            Err(Error::NoRuntimeEndpoint(failures.join("; ")))
        }
    }

    // =========================================================================
    // Hosts file
    // =========================================================================

    /// Reads endpoints from a hosts file. Blank lines and `#` comments are
    /// ignored.
    pub async fn read_hosts_file(path: &Path) -> Result<Vec<String>> {
        let contents = tokio::fs::read_to_string(path).await?;
        contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(normalize_endpoint)
            .collect()
    }

    /// Adds every endpoint listed in `path`. Returns how many were new.
    pub async fn load_hosts_file(&mut self, path: &Path) -> Result<usize> {
        let mut added = 0;
        for endpoint in Self::read_hosts_file(path).await? {
            if self.add_endpoint(&endpoint)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Writes the pool's endpoints to `path`, one per line.
    pub async fn write_hosts_file(&self, path: &Path) -> Result<()> {
        let mut contents = self.endpoints().join("\n");
        contents.push('\n');
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}
