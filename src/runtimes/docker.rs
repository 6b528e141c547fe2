//! # Docker CLI Runtime
//!
//! Implements [`ContainerRuntime`] by running the `docker` CLI against one
//! endpoint (`docker -H <endpoint> ...`).
//!
//! | Operation        | Command                                              |
//! |------------------|------------------------------------------------------|
//! | create           | `create -i --name N [-p H:80/tcp] -v S:T:rw... IMG`  |
//! | start            | `start N`                                            |
//! | stop             | `stop -t SECS N`                                     |
//! | remove           | `rm [-f] N`                                          |
//! | state            | `inspect --type container --format {{json .State}} N`|
//! | attach           | `attach --sig-proxy=false N` (piped stdin/stdout)    |
//! | list_containers  | `ps -a --no-trunc --format {{json .}}`               |
//! | list_images      | `images --format {{.Repository}}:{{.Tag}}`           |
//! | build_image      | `build --rm -t IMG CONTEXT`                          |
//!
//! A missing container is recognised from the CLI's stderr ("No such
//! container") and reported as [`Error::ContainerNotFound`].
//!
//! Every call except `attach` and `build` is bounded by
//! [`RUNTIME_COMMAND_TIMEOUT`]; `stop` additionally gets its grace period.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::catalog::ImageRef;
use crate::constants::{
    CONTAINER_PORT, MAX_COMMAND_OUTPUT, PING_TIMEOUT, RUNTIME_COMMAND_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::runtime::{
    AttachedIo, BuildOutput, ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus,
    ContainerSummary,
};

/// [`ContainerRuntime`] backed by the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    endpoint: String,
    binary: String,
}

impl DockerCliRuntime {
    /// Creates a runtime for `endpoint`.
    ///
    /// A bare `host:port` is taken as `tcp://host:port`.
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            endpoint: normalize_endpoint(endpoint)?,
            binary: "docker".to_string(),
        })
    }

    /// Uses a different CLI binary (e.g. a `podman` docker shim).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-H").arg(&self.endpoint).args(args);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Runs a CLI call to completion and captures its output.
    async fn docker(&self, args: &[&str], limit: Duration) -> Result<Output> {
        debug!(endpoint = %self.endpoint, "docker {}", args.join(" "));

        let mut cmd = self.command(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

        let mut output = timeout(limit, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("docker {}", args.first().copied().unwrap_or_default()),
                duration: limit,
            })?
            .map_err(|e| Error::QueryFailed {
                endpoint: self.endpoint.clone(),
                reason: format!("failed to run {}: {e}", self.binary),
            })?;

        if output.stdout.len() > MAX_COMMAND_OUTPUT {
            output.stdout.truncate(MAX_COMMAND_OUTPUT);
            warn!("docker stdout truncated to {} bytes", MAX_COMMAND_OUTPUT);
        }
        if output.stderr.len() > MAX_COMMAND_OUTPUT {
            output.stderr.truncate(MAX_COMMAND_OUTPUT);
            warn!("docker stderr truncated to {} bytes", MAX_COMMAND_OUTPUT);
        }
        Ok(output)
    }

    /// Runs a call against container `name`, mapping failure with `on_error`.
    async fn container_op(
        &self,
        name: &str,
        args: &[&str],
        limit: Duration,
        on_error: impl FnOnce(String) -> Error,
    ) -> Result<String> {
        let output = self.docker(args, limit).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_container(&stderr) {
            return Err(Error::ContainerNotFound(name.to_string()));
        }
        Err(on_error(stderr.trim().to_string()))
    }
}

/// Validates and normalises a runtime endpoint string.
pub fn normalize_endpoint(endpoint: &str) -> Result<String> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(Error::NoRuntimeEndpoint("empty endpoint".to_string()));
    }
    if endpoint.chars().any(char::is_whitespace) {
        return Err(Error::NoRuntimeEndpoint(format!(
            "endpoint contains whitespace: {endpoint}"
        )));
    }
    if endpoint.contains("://") {
        Ok(endpoint.to_string())
    } else {
        Ok(format!("tcp://{endpoint}"))
    }
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// Arguments of `docker create` for `spec`.
fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string()];
    if spec.interactive {
        args.push("-i".to_string());
    }
    args.push("--name".to_string());
    args.push(spec.name.clone());
    if let Some(port) = spec.host_port {
        args.push("-p".to_string());
        args.push(format!("{port}:{CONTAINER_PORT}/tcp"));
    }
    for mount in &spec.mounts {
        let mode = if mount.read_only { "ro" } else { "rw" };
        args.push("-v".to_string());
        args.push(format!("{}:{}:{mode}", mount.source.display(), mount.target));
    }
    args.push(spec.image.to_string());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    exit_code: i32,
}

fn parse_state(name: &str, json: &str) -> Result<ContainerState> {
    let raw: InspectState = serde_json::from_str(json.trim())?;
    let status = ContainerStatus::parse(&raw.status);
    Ok(ContainerState {
        name: name.to_string(),
        status,
        pid: (raw.pid > 0).then_some(raw.pid),
        exit_code: (status == ContainerStatus::Exited).then_some(raw.exit_code),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    image: String,
    state: String,
}

fn parse_ps(stdout: &str) -> Result<Vec<ContainerSummary>> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let raw: PsLine = serde_json::from_str(line)?;
            Ok(ContainerSummary {
                id: raw.id,
                name: raw.names,
                image: raw.image,
                status: ContainerStatus::parse(&raw.state),
            })
        })
        .collect()
}

fn parse_images(stdout: &str) -> Vec<ImageRef> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let (name, tag) = line.rsplit_once(':')?;
            Some(ImageRef::new(name, tag))
        })
        .collect()
}

fn output_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<()> {
        let output = self
            .docker(&["version", "--format", "{{.Server.Version}}"], PING_TIMEOUT)
            .await?;
        if output.status.success() {
            debug!(endpoint = %self.endpoint, "runtime reachable");
            Ok(())
        } else {
            Err(Error::QueryFailed {
                endpoint: self.endpoint.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let args = create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.docker(&args, RUNTIME_COMMAND_TIMEOUT).await?;
        if !output.status.success() {
            return Err(Error::CreateFailed {
                id: spec.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(container = %spec.name, id = %id, "docker container created");
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.container_op(name, &["start", name], RUNTIME_COMMAND_TIMEOUT, |reason| {
            Error::StartFailed {
                id: name.to_string(),
                reason,
            }
        })
        .await
        .map(drop)
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        self.container_op(
            name,
            &["stop", "-t", &secs, name],
            RUNTIME_COMMAND_TIMEOUT + grace,
            |reason| Error::StopFailed {
                id: name.to_string(),
                reason,
            },
        )
        .await
        .map(drop)
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(name);
        self.container_op(name, &args, RUNTIME_COMMAND_TIMEOUT, |reason| {
            Error::DeleteFailed {
                id: name.to_string(),
                reason,
            }
        })
        .await
        .map(drop)
    }

    async fn state(&self, name: &str) -> Result<ContainerState> {
        let json = self
            .container_op(
                name,
                &["inspect", "--type", "container", "--format", "{{json .State}}", name],
                RUNTIME_COMMAND_TIMEOUT,
                |reason| Error::QueryFailed {
                    endpoint: self.endpoint.clone(),
                    reason,
                },
            )
            .await?;
        parse_state(name, &json)
    }

    async fn attach(&self, name: &str) -> Result<AttachedIo> {
        let mut cmd = self.command(&["attach", "--sig-proxy=false", name]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| Error::AttachFailed {
            id: name.to_string(),
            reason: e.to_string(),
        })?;

        let missing = |stream: &str| Error::AttachFailed {
            id: name.to_string(),
            reason: format!("{stream} not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        debug!(container = %name, "attached");
        Ok(AttachedIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            session: Some(Box::new(child)),
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let output = self
            .docker(
                &["ps", "-a", "--no-trunc", "--format", "{{json .}}"],
                RUNTIME_COMMAND_TIMEOUT,
            )
            .await?;
        if !output.status.success() {
            return Err(Error::QueryFailed {
                endpoint: self.endpoint.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_ps(&String::from_utf8_lossy(&output.stdout))
    }

    async fn list_images(&self) -> Result<Vec<ImageRef>> {
        let output = self
            .docker(
                &["images", "--format", "{{.Repository}}:{{.Tag}}"],
                RUNTIME_COMMAND_TIMEOUT,
            )
            .await?;
        if !output.status.success() {
            return Err(Error::QueryFailed {
                endpoint: self.endpoint.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_images(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn build_image(&self, image: &ImageRef, context: &Path) -> Result<BuildOutput> {
        let tag = image.to_string();
        let context = context.to_string_lossy();
        let mut cmd = self.command(&["build", "--rm", "-t", &tag, &context]);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| Error::QueryFailed {
            endpoint: self.endpoint.clone(),
            reason: format!("failed to run {} build: {e}", self.binary),
        })?;

        Ok(BuildOutput {
            success: output.status.success(),
            log: output_lines(&output),
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BindMount;
    use std::path::PathBuf;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(
            normalize_endpoint("10.0.0.5:2375").unwrap(),
            "tcp://10.0.0.5:2375"
        );
        assert_eq!(
            normalize_endpoint(" unix:///var/run/docker.sock\n").unwrap(),
            "unix:///var/run/docker.sock"
        );
        assert!(normalize_endpoint("").is_err());
        assert!(normalize_endpoint("a b").is_err());
    }

    #[test]
    fn test_create_args() {
        let spec = ContainerSpec {
            name: "project_3".to_string(),
            image: ImageRef::new("trainer", "v1"),
            mounts: vec![BindMount {
                source: PathBuf::from("/data/3/model"),
                target: "/app/model".to_string(),
                read_only: false,
            }],
            host_port: Some(8103),
            interactive: true,
        };
        assert_eq!(
            create_args(&spec),
            vec![
                "create",
                "-i",
                "--name",
                "project_3",
                "-p",
                "8103:80/tcp",
                "-v",
                "/data/3/model:/app/model:rw",
                "trainer:v1",
            ]
        );
    }

    #[test]
    fn test_parse_state() {
        let json = r#"{"Status":"exited","Running":false,"Pid":0,"ExitCode":137}"#;
        let state = parse_state("project_1", json).unwrap();
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.exit_code, Some(137));
        assert!(state.pid.is_none());

        let json = r#"{"Status":"running","Pid":4242,"ExitCode":0}"#;
        let state = parse_state("project_1", json).unwrap();
        assert!(state.is_running());
        assert_eq!(state.pid, Some(4242));
    }

    #[test]
    fn test_parse_ps() {
        let stdout = concat!(
            r#"{"ID":"abc","Names":"project_7","Image":"trainer:v1","State":"running","Status":"Up 2 minutes"}"#,
            "\n",
            r#"{"ID":"def","Names":"redis","Image":"redis:7","State":"exited","Status":"Exited (0)"}"#,
            "\n"
        );
        let containers = parse_ps(stdout).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "project_7");
        assert_eq!(containers[0].status, ContainerStatus::Running);
        assert_eq!(containers[1].status, ContainerStatus::Exited);
    }

    #[test]
    fn test_parse_images() {
        let images = parse_images("trainer:v1\n<none>:<none>\nlocalhost:5000/x:latest\n\n");
        assert_eq!(images.len(), 3);
        assert_eq!(images[0], ImageRef::new("trainer", "v1"));
        assert_eq!(images[2], ImageRef::new("localhost:5000/x", "latest"));
    }

    #[test]
    fn test_missing_container_detection() {
        assert!(is_missing_container(
            "Error response from daemon: No such container: project_9"
        ));
        assert!(is_missing_container("Error: No such object: project_9"));
        assert!(!is_missing_container("permission denied"));
    }
}
