//! Container lifecycle management over the provisioned bridge.
//!
//! Two flavors of the same operations:
//! - `GuestCliOps`: drives the `docker` CLI inside the guest through the
//!   transport bridge (WSL and QEMU backends);
//! - `EngineOps`: talks to the engine API directly with bollard (Docker
//!   Desktop backend).
//!
//! Exactly one long-lived analysis container per session, addressed by its
//! fixed well-known name. A failed command leaves the environment
//! Ready/Degraded; only an explicit destroy tears anything down.

use crate::capability::BackendKind;
use crate::command::{CommandResult, OutputSink, RemoteCommand, TransferDirection, TransferRequest};
use crate::constants::{
    ANALYSIS_DIR, ANALYSIS_IMAGE, CONTAINER_NAME, CONTAINER_OP_TIMEOUT, VOLUME_NAME,
};
use crate::error::{Error, Result};
use crate::provision::docker::ensure_analysis_container;
use crate::session::{ConnectionParams, ProvisionedEnvironment, SessionState};
use crate::transport::docker::api_err;
use crate::transport::TransportBridge;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::query_parameters::{
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Container Status
// =============================================================================

/// Observed state of the analysis container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    NotFound,
    /// The backend answered but the status line was unparseable.
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::NotFound => write!(f, "not-found"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Parses one `docker ps -a --format '{{.Names}}|{{.Status}}'` line for
/// the named container.
pub(crate) fn parse_ps_line(line: &str, name: &str) -> Option<ContainerStatus> {
    let (ps_name, status) = line.split_once('|')?;
    if ps_name.trim() != name {
        return None;
    }
    let status = status.trim();
    if status.starts_with("Up") {
        Some(ContainerStatus::Running)
    } else if status.starts_with("Exited") || status.starts_with("Created") {
        Some(ContainerStatus::Stopped)
    } else {
        Some(ContainerStatus::Unknown)
    }
}

// =============================================================================
// Container Ops Trait
// =============================================================================

/// Backend-flavored container operations.
#[async_trait]
pub trait ContainerOps: Send + Sync {
    /// Ensures the container exists and is started; returns its id/name.
    async fn ensure(&self) -> Result<String>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn restart(&self) -> Result<()>;
    async fn remove(&self) -> Result<()>;
    async fn status(&self) -> Result<ContainerStatus>;
    /// Recent container log output (last `tail` lines).
    async fn logs(&self, tail: usize) -> Result<String>;
    /// Rewrites a user command into this flavor's container exec.
    fn wrap_exec(&self, cmd: &RemoteCommand) -> RemoteCommand;
    /// Moves a file between the host and the container's analysis volume.
    /// The token aborts an in-flight transfer.
    async fn transfer(&self, req: &TransferRequest, cancel: &CancellationToken) -> Result<()>;
}

// =============================================================================
// Guest CLI Flavor
// =============================================================================

/// Drives the in-guest `docker` CLI through the bridge (WSL, QEMU).
pub struct GuestCliOps {
    bridge: Arc<TransportBridge>,
    /// Prefix commands with `sudo -n` (SSH guests; the WSL engine is
    /// group-accessible after provisioning).
    sudo: bool,
}

impl GuestCliOps {
    pub fn new(bridge: Arc<TransportBridge>, sudo: bool) -> Self {
        Self { bridge, sudo }
    }

    fn docker_argv(&self, tail: &[&str]) -> Vec<String> {
        let mut argv = Vec::new();
        if self.sudo {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
        }
        argv.push("docker".to_string());
        argv.extend(tail.iter().map(|s| s.to_string()));
        argv
    }

    /// Runs a docker CLI command in the guest, failing on non-zero exit.
    async fn run_cli(&self, tail: &[&str]) -> Result<String> {
        let cmd = RemoteCommand::new(self.docker_argv(tail)).timeout(CONTAINER_OP_TIMEOUT);
        let (result, stdout, stderr) = self.bridge.run_captured(&cmd).await?;
        if !result.is_success() {
            return Err(Error::CommandFailed(format!(
                "docker {} exited with {}: {}",
                tail.first().copied().unwrap_or(""),
                result.exit_code,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }

    /// True if `path` exists inside the analysis container.
    ///
    /// `docker cp` replaces its destination unconditionally, so the
    /// conflict check has to happen here before any byte moves.
    async fn container_path_exists(&self, path: &str) -> Result<bool> {
        let mut argv = self.docker_argv(&["exec", CONTAINER_NAME, "test", "-e"]);
        argv.push(path.to_string());
        let cmd = RemoteCommand::new(argv).timeout(CONTAINER_OP_TIMEOUT);
        let (result, _, _) = self.bridge.run_captured(&cmd).await?;
        Ok(result.is_success())
    }
}

/// Distinguishes concurrent staging copies of same-named files.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[async_trait]
impl ContainerOps for GuestCliOps {
    async fn ensure(&self) -> Result<String> {
        match self.status().await? {
            ContainerStatus::Running => {}
            ContainerStatus::Stopped => self.start().await?,
            ContainerStatus::NotFound => {
                info!(container = CONTAINER_NAME, "creating analysis container");
                let bind = format!("{VOLUME_NAME}:{ANALYSIS_DIR}");
                self.run_cli(&[
                    "run",
                    "-d",
                    "--name",
                    CONTAINER_NAME,
                    "-v",
                    &bind,
                    "--entrypoint",
                    "/bin/bash",
                    "-it",
                    ANALYSIS_IMAGE,
                ])
                .await?;
            }
            ContainerStatus::Unknown => {
                return Err(Error::CommandFailed(
                    "container status unparseable; refusing to create a duplicate".to_string(),
                ))
            }
        }
        Ok(CONTAINER_NAME.to_string())
    }

    async fn start(&self) -> Result<()> {
        self.run_cli(&["start", CONTAINER_NAME]).await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        self.run_cli(&["stop", CONTAINER_NAME]).await.map(|_| ())
    }

    async fn restart(&self) -> Result<()> {
        self.run_cli(&["restart", CONTAINER_NAME]).await.map(|_| ())
    }

    async fn remove(&self) -> Result<()> {
        self.run_cli(&["rm", "-f", CONTAINER_NAME]).await.map(|_| ())
    }

    async fn status(&self) -> Result<ContainerStatus> {
        let stdout = self
            .run_cli(&["ps", "-a", "--format", "{{.Names}}|{{.Status}}"])
            .await?;
        Ok(stdout
            .lines()
            .find_map(|l| parse_ps_line(l, CONTAINER_NAME))
            .unwrap_or(ContainerStatus::NotFound))
    }

    async fn logs(&self, tail: usize) -> Result<String> {
        self.run_cli(&["logs", "--tail", &tail.to_string(), CONTAINER_NAME])
            .await
    }

    fn wrap_exec(&self, cmd: &RemoteCommand) -> RemoteCommand {
        let mut argv = Vec::new();
        if self.sudo {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
        }
        argv.push("docker".to_string());
        argv.push("exec".to_string());
        if let Some(dir) = &cmd.working_dir {
            argv.push("-w".to_string());
            argv.push(dir.clone());
        }
        argv.push(CONTAINER_NAME.to_string());
        argv.extend(cmd.argv.iter().cloned());
        RemoteCommand {
            argv,
            // The working directory is carried by `exec -w`, not by a `cd`
            // on the guest.
            working_dir: None,
            timeout: cmd.timeout,
        }
    }

    async fn transfer(&self, req: &TransferRequest, cancel: &CancellationToken) -> Result<()> {
        // Two hops: the bridge reaches the guest filesystem, `docker cp`
        // crosses into the container's volume.
        let file_name = req
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::TransferFailed {
                path: req.local_path.display().to_string(),
                reason: "local path has no file name".to_string(),
            })?;
        let staging = format!(
            "/tmp/fwbridge-{}-{}-{file_name}",
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        match req.direction {
            TransferDirection::Upload => {
                if !req.overwrite && self.container_path_exists(&req.remote_path).await? {
                    return Err(Error::PathConflict {
                        path: req.remote_path.clone(),
                    });
                }
                let hop = TransferRequest::upload(&req.local_path, &staging)
                    .overwrite(true);
                self.bridge.transfer(&hop, cancel).await?;
                let target = format!("{CONTAINER_NAME}:{}", req.remote_path);
                let copy = self.run_cli(&["cp", &staging, &target]).await;
                let _ = self
                    .bridge
                    .run_captured(
                        &RemoteCommand::new(["rm", "-f", staging.as_str()])
                            .timeout(CONTAINER_OP_TIMEOUT),
                    )
                    .await;
                copy.map(|_| ())
            }
            TransferDirection::Download => {
                let source = format!("{CONTAINER_NAME}:{}", req.remote_path);
                self.run_cli(&["cp", &source, &staging]).await?;
                let hop = TransferRequest::download(&staging, &req.local_path)
                    .overwrite(req.overwrite);
                let fetched = self.bridge.transfer(&hop, cancel).await;
                let _ = self
                    .bridge
                    .run_captured(
                        &RemoteCommand::new(["rm", "-f", staging.as_str()])
                            .timeout(CONTAINER_OP_TIMEOUT),
                    )
                    .await;
                fetched
            }
        }
    }
}

// =============================================================================
// Engine API Flavor
// =============================================================================

/// Talks to the engine directly (Docker Desktop).
pub struct EngineOps {
    docker: Docker,
    bridge: Arc<TransportBridge>,
}

impl EngineOps {
    pub fn new(socket_path: Option<&str>, bridge: Arc<TransportBridge>) -> Result<Self> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(api_err)?;
        Ok(Self { docker, bridge })
    }
}

#[async_trait]
impl ContainerOps for EngineOps {
    async fn ensure(&self) -> Result<String> {
        ensure_analysis_container(&self.docker).await
    }

    async fn start(&self) -> Result<()> {
        self.docker
            .start_container(
                CONTAINER_NAME,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
            .map_err(api_err)
    }

    async fn stop(&self) -> Result<()> {
        self.docker
            .stop_container(
                CONTAINER_NAME,
                Some(StopContainerOptionsBuilder::new().t(5).build()),
            )
            .await
            .map_err(api_err)
    }

    async fn restart(&self) -> Result<()> {
        self.docker
            .restart_container(
                CONTAINER_NAME,
                None::<bollard::query_parameters::RestartContainerOptions>,
            )
            .await
            .map_err(api_err)
    }

    async fn remove(&self) -> Result<()> {
        self.docker
            .remove_container(
                CONTAINER_NAME,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            )
            .await
            .map_err(api_err)
    }

    async fn status(&self) -> Result<ContainerStatus> {
        match self
            .docker
            .inspect_container(
                CONTAINER_NAME,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
        {
            Ok(inspect) => Ok(match inspect.state.and_then(|s| s.running) {
                Some(true) => ContainerStatus::Running,
                Some(false) => ContainerStatus::Stopped,
                None => ContainerStatus::Unknown,
            }),
            Err(e) if crate::provision::docker::is_not_found(&e) => Ok(ContainerStatus::NotFound),
            Err(e) => Err(api_err(e)),
        }
    }

    async fn logs(&self, tail: usize) -> Result<String> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail.to_string())
            .build();
        let mut stream = self.docker.logs(CONTAINER_NAME, Some(options));
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item.map_err(api_err)? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    text.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(text)
    }

    fn wrap_exec(&self, cmd: &RemoteCommand) -> RemoteCommand {
        // The docker transport already execs inside the container.
        cmd.clone()
    }

    async fn transfer(&self, req: &TransferRequest, cancel: &CancellationToken) -> Result<()> {
        self.bridge.transfer(req, cancel).await
    }
}

// =============================================================================
// Container Manager
// =============================================================================

/// Front door for container lifecycle, analysis runs, and file movement.
pub struct ContainerManager {
    session: Arc<SessionState>,
    bridge: Arc<TransportBridge>,
    ops: Box<dyn ContainerOps>,
}

impl ContainerManager {
    /// Builds the manager matching the provisioned environment.
    pub fn from_environment(
        session: Arc<SessionState>,
        env: &ProvisionedEnvironment,
    ) -> Result<Self> {
        let bridge = Arc::new(TransportBridge::connect(&env.connection)?);
        let ops: Box<dyn ContainerOps> = match &env.connection {
            ConnectionParams::Wsl { .. } => Box::new(GuestCliOps::new(bridge.clone(), false)),
            ConnectionParams::Ssh { .. } => Box::new(GuestCliOps::new(bridge.clone(), true)),
            ConnectionParams::DockerSocket { socket_path } => Box::new(EngineOps::new(
                socket_path.as_deref(),
                bridge.clone(),
            )?),
        };
        debug!(backend = %env.backend, transport = bridge.transport_name(), "manager ready");
        Ok(Self {
            session,
            bridge,
            ops,
        })
    }

    /// Assembles a manager from explicit parts (tests).
    pub fn with_ops(
        session: Arc<SessionState>,
        bridge: Arc<TransportBridge>,
        ops: Box<dyn ContainerOps>,
    ) -> Self {
        Self {
            session,
            bridge,
            ops,
        }
    }

    /// The underlying bridge (health flag, direct transfers).
    pub fn bridge(&self) -> &Arc<TransportBridge> {
        &self.bridge
    }

    /// Ensures the analysis container exists and is running.
    pub async fn ensure_container(&self) -> Result<String> {
        let id = self.ops.ensure().await?;
        self.session.set_container(Some(id.clone()))?;
        Ok(id)
    }

    pub async fn start(&self) -> Result<()> {
        self.ops.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.ops.stop().await
    }

    pub async fn restart(&self) -> Result<()> {
        self.ops.restart().await
    }

    /// Removes the container; the volume and its contents survive.
    pub async fn remove(&self) -> Result<()> {
        self.ops.remove().await?;
        self.session.set_container(None)?;
        Ok(())
    }

    pub async fn status(&self) -> Result<ContainerStatus> {
        self.ops.status().await
    }

    pub async fn logs(&self, tail: usize) -> Result<String> {
        self.ops.logs(tail).await
    }

    /// Runs a command inside the analysis container, streaming output.
    ///
    /// A failing command returns its exit code in the result; only
    /// transport-level trouble is an error, and neither mutates the
    /// environment state.
    pub async fn execute(
        &self,
        cmd: &RemoteCommand,
        sink: OutputSink,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let wrapped = self.ops.wrap_exec(cmd);
        self.bridge.execute(&wrapped, sink, cancel).await
    }

    /// Moves a file in or out of the analysis volume.
    pub async fn transfer(&self, req: &TransferRequest, cancel: &CancellationToken) -> Result<()> {
        self.ops.transfer(req, cancel).await
    }

    /// Probes the backend and flips Ready↔Degraded accordingly.
    pub async fn health_check(&self) -> bool {
        let transport_alive = self.bridge.health_check().await;
        let healthy = transport_alive
            && matches!(self.ops.status().await, Ok(ContainerStatus::Running));

        self.bridge.set_degraded(!healthy);
        if let Err(e) = self.session.apply_health(healthy) {
            warn!(error = %e, "health flip not recorded");
        }
        healthy
    }
}
