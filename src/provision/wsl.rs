//! WSL backend driver (WSL2 and the WSL1 fallback).
//!
//! Both variants share the same mechanics: `wsl.exe` manages the distro
//! from the host, and every in-guest step is `wsl.exe -d <distro> -u root
//! -- sh -c <script>`. Running as root sidesteps sudo configuration inside
//! a freshly registered distro. The only difference between the variants
//! is the version pin after registration.

use crate::capability::{decode_console_output, BackendKind};
use crate::constants::{
    ANALYSIS_DIR, ANALYSIS_IMAGE, CONTAINER_NAME, GUEST_CONFIGURE_TIMEOUT, GUEST_DISTRO,
    GUEST_INSTALL_TIMEOUT, IMAGE_PULL_TIMEOUT, VOLUME_NAME, WSL_COMMAND_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::session::ConnectionParams;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::BackendDriver;

/// Driver for the WSL-hosted guest.
pub struct WslDriver {
    kind: BackendKind,
    distro: String,
}

impl WslDriver {
    /// WSL2 variant (preferred).
    pub fn wsl2() -> Self {
        Self {
            kind: BackendKind::Wsl2,
            distro: GUEST_DISTRO.to_string(),
        }
    }

    /// WSL1 variant (no full kernel; degraded but workable).
    pub fn wsl1() -> Self {
        Self {
            kind: BackendKind::Wsl1,
            distro: GUEST_DISTRO.to_string(),
        }
    }

    /// Overrides the distro name (tests, unconventional hosts).
    pub fn with_distro(mut self, distro: impl Into<String>) -> Self {
        self.distro = distro.into();
        self
    }

    /// Runs a host-side `wsl.exe` management command.
    async fn run_wsl(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<(bool, String, String)> {
        debug!(?args, "wsl.exe");
        let mut cmd = Command::new("wsl.exe");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("wsl.exe {}", args.join(" ")),
                duration: timeout,
            })??;

        Ok((
            output.status.success(),
            decode_console_output(&output.stdout),
            decode_console_output(&output.stderr),
        ))
    }

    /// Runs a script inside the distro as root.
    async fn run_in_guest(&self, script: &str, timeout: Duration) -> Result<(bool, String, String)> {
        self.run_wsl(
            &["-d", &self.distro, "-u", "root", "--", "sh", "-c", script],
            timeout,
        )
        .await
    }
}

#[async_trait]
impl BackendDriver for WslDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn connection_params(&self) -> ConnectionParams {
        ConnectionParams::Wsl {
            distro: self.distro.clone(),
        }
    }

    async fn guest_present(&self) -> Result<bool> {
        let (ok, stdout, _) = self
            .run_wsl(&["--list", "--quiet"], WSL_COMMAND_TIMEOUT)
            .await?;
        if !ok {
            return Ok(false);
        }
        let present = stdout
            .lines()
            .any(|l| l.trim().eq_ignore_ascii_case(&self.distro));
        debug!(distro = %self.distro, present, "guest check");
        Ok(present)
    }

    async fn install_guest(&self) -> Result<()> {
        info!(distro = %self.distro, "registering distro");
        let (ok, _, stderr) = self
            .run_wsl(
                &["--install", "-d", &self.distro, "--no-launch"],
                GUEST_INSTALL_TIMEOUT,
            )
            .await?;
        if !ok {
            return Err(Error::CommandFailed(format!(
                "wsl --install {} failed: {}",
                self.distro,
                stderr.trim()
            )));
        }

        // Pin the distro to this variant's version. A failure here is often
        // "already converted"; log and continue.
        let version = if self.kind == BackendKind::Wsl2 { "2" } else { "1" };
        let (ok, _, stderr) = self
            .run_wsl(
                &["--set-version", &self.distro, version],
                GUEST_INSTALL_TIMEOUT,
            )
            .await?;
        if !ok {
            warn!(distro = %self.distro, version, stderr = %stderr.trim(), "set-version not applied");
        }
        Ok(())
    }

    async fn configure_guest(&self) -> Result<()> {
        let (configured, _, _) = self
            .run_in_guest(
                "command -v docker >/dev/null 2>&1 && docker info >/dev/null 2>&1",
                WSL_COMMAND_TIMEOUT,
            )
            .await?;
        if configured {
            debug!(distro = %self.distro, "engine already configured");
            return Ok(());
        }

        info!(distro = %self.distro, "installing container engine in guest");
        let (ok, _, stderr) = self
            .run_in_guest(
                "export DEBIAN_FRONTEND=noninteractive; \
                 apt-get update -qq && apt-get install -y -qq docker.io",
                GUEST_CONFIGURE_TIMEOUT,
            )
            .await?;
        if !ok {
            return Err(Error::CommandFailed(format!(
                "engine install failed: {}",
                stderr.trim()
            )));
        }

        let (ok, _, stderr) = self
            .run_in_guest(
                "service docker start >/dev/null 2>&1 || true; docker info >/dev/null 2>&1",
                GUEST_CONFIGURE_TIMEOUT,
            )
            .await?;
        if !ok {
            return Err(Error::CommandFailed(format!(
                "engine did not come up: {}",
                stderr.trim()
            )));
        }

        // Let the distro's default user talk to the engine without sudo;
        // transport commands run as that user.
        self.run_in_guest(
            "u=$(getent passwd 1000 | cut -d: -f1); \
             [ -n \"$u\" ] && usermod -aG docker \"$u\" || true",
            WSL_COMMAND_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn pull_image(&self) -> Result<()> {
        let probe = format!("docker image inspect {ANALYSIS_IMAGE} >/dev/null 2>&1");
        let (present, _, _) = self.run_in_guest(&probe, WSL_COMMAND_TIMEOUT).await?;
        if present {
            debug!(image = ANALYSIS_IMAGE, "image already present");
            return Ok(());
        }

        info!(image = ANALYSIS_IMAGE, "pulling analysis image");
        let pull = format!("docker pull {ANALYSIS_IMAGE}");
        let (ok, _, stderr) = self.run_in_guest(&pull, IMAGE_PULL_TIMEOUT).await?;
        if !ok {
            return Err(Error::CommandFailed(format!(
                "image pull failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn create_workspace(&self) -> Result<(String, String)> {
        let ensure_volume = format!(
            "docker volume inspect {VOLUME_NAME} >/dev/null 2>&1 || docker volume create {VOLUME_NAME}"
        );
        let (ok, _, stderr) = self
            .run_in_guest(&ensure_volume, WSL_COMMAND_TIMEOUT)
            .await?;
        if !ok {
            return Err(Error::CommandFailed(format!(
                "volume creation failed: {}",
                stderr.trim()
            )));
        }

        let ensure_container = format!(
            "docker ps -a --format '{{{{.Names}}}}' | grep -qx {CONTAINER_NAME} || \
             docker run -d --name {CONTAINER_NAME} -v {VOLUME_NAME}:{ANALYSIS_DIR} \
             --entrypoint /bin/bash -it {ANALYSIS_IMAGE}"
        );
        let (ok, _, stderr) = self
            .run_in_guest(&ensure_container, GUEST_CONFIGURE_TIMEOUT)
            .await?;
        if !ok {
            return Err(Error::CommandFailed(format!(
                "container creation failed: {}",
                stderr.trim()
            )));
        }

        let inspect = format!("docker inspect -f '{{{{.Id}}}}' {CONTAINER_NAME}");
        let (ok, stdout, stderr) = self.run_in_guest(&inspect, WSL_COMMAND_TIMEOUT).await?;
        if !ok {
            return Err(Error::CommandFailed(format!(
                "container inspect failed: {}",
                stderr.trim()
            )));
        }
        Ok((VOLUME_NAME.to_string(), stdout.trim().to_string()))
    }
}
