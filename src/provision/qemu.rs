//! QEMU backend driver - the universal last resort.
//!
//! Boots a prepared guest disk image with `qemu-system-x86_64` and
//! user-mode networking forwarding a loopback host port to guest SSH.
//! Needs only CPU virtualization extensions (falls back to TCG when no
//! accelerator is usable), so it works on hosts where neither WSL nor
//! Docker Desktop can. Every in-guest step runs over the same SSH
//! transport the bridge will use once the environment is Ready.

use crate::capability::BackendKind;
use crate::command::RemoteCommand;
use crate::constants::{
    ANALYSIS_DIR, ANALYSIS_IMAGE, CONTAINER_NAME, GUEST_BOOT_POLL_INTERVAL, GUEST_BOOT_TIMEOUT,
    GUEST_CONFIGURE_TIMEOUT, IMAGE_PULL_TIMEOUT, SSH_DEFAULT_HOST, SSH_DEFAULT_PORT,
    SSH_DEFAULT_USER, VOLUME_NAME, WSL_COMMAND_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::session::ConnectionParams;
use crate::transport::{SshTransport, TransportBridge};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

use super::BackendDriver;

const VM_MEMORY_MIB: u32 = 4096;
const VM_CPUS: u32 = 2;
const VM_IMAGE_FILE: &str = "analysis.qcow2";

/// Driver for the QEMU-hosted guest.
pub struct QemuDriver {
    image_path: PathBuf,
    host: String,
    port: u16,
    user: String,
    identity_file: Option<PathBuf>,
}

impl Default for QemuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl QemuDriver {
    pub fn new() -> Self {
        let image_path = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("fwbridge")
            .join("qemu")
            .join(VM_IMAGE_FILE);
        Self {
            image_path,
            host: SSH_DEFAULT_HOST.to_string(),
            port: SSH_DEFAULT_PORT,
            user: SSH_DEFAULT_USER.to_string(),
            identity_file: None,
        }
    }

    /// Overrides the guest disk image location.
    pub fn with_image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = path.into();
        self
    }

    /// Uses a specific SSH identity file instead of the agent.
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    fn bridge(&self) -> TransportBridge {
        TransportBridge::new(Arc::new(SshTransport::new(
            self.host.clone(),
            self.port,
            self.user.clone(),
            self.identity_file.clone(),
        )))
    }

    /// Runs a script in the guest over SSH, capturing output.
    async fn run_ssh(&self, script: &str, timeout: Duration) -> Result<(i32, String, String)> {
        let cmd = RemoteCommand::new(["sh", "-c", script]).timeout(timeout);
        let (result, stdout, stderr) = self.bridge().run_captured(&cmd).await?;
        Ok((result.exit_code, stdout, stderr))
    }

    async fn ssh_alive(&self) -> bool {
        self.bridge().health_check().await
    }

    /// Boots the VM if SSH is not already answering, then waits for it.
    async fn ensure_booted(&self) -> Result<()> {
        if self.ssh_alive().await {
            debug!("guest already answering on ssh");
            return Ok(());
        }

        info!(image = %self.image_path.display(), "booting qemu guest");
        let mut cmd = Command::new("qemu-system-x86_64");
        cmd.arg("-m")
            .arg(VM_MEMORY_MIB.to_string())
            .arg("-smp")
            .arg(VM_CPUS.to_string())
            .arg("-drive")
            .arg(format!(
                "file={},format=qcow2,if=virtio",
                self.image_path.display()
            ))
            .arg("-netdev")
            .arg(format!(
                "user,id=net0,hostfwd=tcp:{}:{}-:22",
                self.host, self.port
            ))
            .arg("-device")
            .arg("virtio-net-pci,netdev=net0")
            .arg("-display")
            .arg("none")
            // Hardware acceleration when available, TCG otherwise.
            .arg("-accel")
            .arg("whpx")
            .arg("-accel")
            .arg("tcg")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // The VM outlives this process; the child handle is dropped
        // without kill_on_drop.
        let _child = cmd.spawn().map_err(|e| {
            Error::CommandFailed(format!("failed to launch qemu-system-x86_64: {e}"))
        })?;

        let deadline = Instant::now() + GUEST_BOOT_TIMEOUT;
        while Instant::now() < deadline {
            tokio::time::sleep(GUEST_BOOT_POLL_INTERVAL).await;
            if self.ssh_alive().await {
                info!("guest is up");
                return Ok(());
            }
        }
        Err(Error::Timeout {
            operation: "guest boot".to_string(),
            duration: GUEST_BOOT_TIMEOUT,
        })
    }
}

#[async_trait]
impl BackendDriver for QemuDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Qemu
    }

    fn connection_params(&self) -> ConnectionParams {
        ConnectionParams::Ssh {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            identity_file: self.identity_file.clone(),
        }
    }

    async fn guest_present(&self) -> Result<bool> {
        Ok(self.image_path.is_file())
    }

    async fn install_guest(&self) -> Result<()> {
        // Image distribution is handled by the installer, not this crate.
        if !self.image_path.is_file() {
            return Err(Error::CommandFailed(format!(
                "guest disk image not found at {}; place a prepared image there",
                self.image_path.display()
            )));
        }
        self.ensure_booted().await
    }

    async fn configure_guest(&self) -> Result<()> {
        self.ensure_booted().await?;

        let (exit, _, stderr) = self
            .run_ssh(
                "systemctl is-active --quiet docker || sudo -n systemctl start docker",
                GUEST_CONFIGURE_TIMEOUT,
            )
            .await?;
        if exit != 0 {
            return Err(Error::CommandFailed(format!(
                "docker service did not start in guest: {}",
                stderr.trim()
            )));
        }

        let (exit, _, stderr) = self
            .run_ssh("sudo -n docker info >/dev/null", WSL_COMMAND_TIMEOUT)
            .await?;
        if exit != 0 {
            return Err(Error::CommandFailed(format!(
                "docker engine unreachable in guest: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn pull_image(&self) -> Result<()> {
        let probe = format!("sudo -n docker image inspect {ANALYSIS_IMAGE} >/dev/null 2>&1");
        let (exit, _, _) = self.run_ssh(&probe, WSL_COMMAND_TIMEOUT).await?;
        if exit == 0 {
            debug!(image = ANALYSIS_IMAGE, "image already present in guest");
            return Ok(());
        }

        info!(image = ANALYSIS_IMAGE, "pulling analysis image in guest");
        let pull = format!("sudo -n docker pull {ANALYSIS_IMAGE}");
        let (exit, _, stderr) = self.run_ssh(&pull, IMAGE_PULL_TIMEOUT).await?;
        if exit != 0 {
            return Err(Error::CommandFailed(format!(
                "image pull failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn create_workspace(&self) -> Result<(String, String)> {
        let ensure_volume = format!(
            "sudo -n docker volume inspect {VOLUME_NAME} >/dev/null 2>&1 || \
             sudo -n docker volume create {VOLUME_NAME}"
        );
        let (exit, _, stderr) = self.run_ssh(&ensure_volume, WSL_COMMAND_TIMEOUT).await?;
        if exit != 0 {
            return Err(Error::CommandFailed(format!(
                "volume creation failed: {}",
                stderr.trim()
            )));
        }

        let ensure_container = format!(
            "sudo -n docker ps -a --format '{{{{.Names}}}}' | grep -qx {CONTAINER_NAME} || \
             sudo -n docker run -d --name {CONTAINER_NAME} -v {VOLUME_NAME}:{ANALYSIS_DIR} \
             --entrypoint /bin/bash -it {ANALYSIS_IMAGE}"
        );
        let (exit, _, stderr) = self
            .run_ssh(&ensure_container, GUEST_CONFIGURE_TIMEOUT)
            .await?;
        if exit != 0 {
            return Err(Error::CommandFailed(format!(
                "container creation failed: {}",
                stderr.trim()
            )));
        }

        let inspect = format!("sudo -n docker inspect -f '{{{{.Id}}}}' {CONTAINER_NAME}");
        let (exit, stdout, stderr) = self.run_ssh(&inspect, WSL_COMMAND_TIMEOUT).await?;
        if exit != 0 {
            return Err(Error::CommandFailed(format!(
                "container inspect failed: {}",
                stderr.trim()
            )));
        }
        Ok((VOLUME_NAME.to_string(), stdout.trim().to_string()))
    }
}
