//! Docker Desktop backend driver.
//!
//! The "guest" here is Docker Desktop's own utility VM, so there is no
//! distro to register or engine to install: present means the engine API
//! answers a ping, install means starting the Docker Desktop application
//! and waiting for the engine, and configure is a no-op. Image pull and
//! workspace creation go through the engine API directly.

use crate::capability::BackendKind;
use crate::constants::{
    ANALYSIS_DIR, ANALYSIS_IMAGE, CONTAINER_NAME, GUEST_BOOT_POLL_INTERVAL, GUEST_BOOT_TIMEOUT,
    VOLUME_NAME,
};
use crate::error::{Error, Result};
use crate::session::ConnectionParams;
use crate::transport::docker::api_err;
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{CreateContainerOptionsBuilder, CreateImageOptionsBuilder};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::TryStreamExt;
use std::process::Stdio;
use std::time::Instant;
use tracing::{debug, info};

use super::BackendDriver;

/// Default install location of the Docker Desktop frontend.
const DOCKER_DESKTOP_EXE: &str = r"C:\Program Files\Docker\Docker\Docker Desktop.exe";

const ENGINE_TIMEOUT_SECS: u64 = 120;

/// Driver for the host Docker Desktop engine.
pub struct DockerDesktopDriver {
    socket_path: Option<String>,
}

impl Default for DockerDesktopDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerDesktopDriver {
    pub fn new() -> Self {
        Self { socket_path: None }
    }

    /// Targets an explicit engine socket instead of the platform default.
    pub fn with_socket_path(mut self, path: impl Into<String>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    fn client(&self) -> Result<Docker> {
        match &self.socket_path {
            Some(path) => {
                Docker::connect_with_socket(path, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(api_err)
    }

    async fn engine_answers(&self) -> bool {
        match self.client() {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl BackendDriver for DockerDesktopDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::DockerDesktop
    }

    fn connection_params(&self) -> ConnectionParams {
        ConnectionParams::DockerSocket {
            socket_path: self.socket_path.clone(),
        }
    }

    async fn guest_present(&self) -> Result<bool> {
        let answers = self.engine_answers().await;
        debug!(answers, "engine ping");
        Ok(answers)
    }

    async fn install_guest(&self) -> Result<()> {
        info!("starting Docker Desktop");
        let mut cmd = tokio::process::Command::new(DOCKER_DESKTOP_EXE);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Docker Desktop outlives this process; the handle is dropped.
        let _child = cmd.spawn().map_err(|e| {
            Error::CommandFailed(format!("failed to launch Docker Desktop: {e}"))
        })?;

        let deadline = Instant::now() + GUEST_BOOT_TIMEOUT;
        while Instant::now() < deadline {
            tokio::time::sleep(GUEST_BOOT_POLL_INTERVAL).await;
            if self.engine_answers().await {
                info!("engine is up");
                return Ok(());
            }
        }
        Err(Error::Timeout {
            operation: "docker desktop startup".to_string(),
            duration: GUEST_BOOT_TIMEOUT,
        })
    }

    async fn configure_guest(&self) -> Result<()> {
        // Docker Desktop ships its engine preconfigured.
        Ok(())
    }

    async fn pull_image(&self) -> Result<()> {
        let docker = self.client()?;
        if docker.inspect_image(ANALYSIS_IMAGE).await.is_ok() {
            debug!(image = ANALYSIS_IMAGE, "image already present");
            return Ok(());
        }

        info!(image = ANALYSIS_IMAGE, "pulling analysis image");
        let (from_image, tag) = match ANALYSIS_IMAGE.rsplit_once(':') {
            Some((img, tag)) => (img, tag),
            None => (ANALYSIS_IMAGE, "latest"),
        };
        docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn create_workspace(&self) -> Result<(String, String)> {
        let docker = self.client()?;
        let id = ensure_analysis_container(&docker).await?;
        Ok((VOLUME_NAME.to_string(), id))
    }
}

/// Ensures the long-lived analysis container exists and is started,
/// returning its id. Convergent by the fixed well-known name; shared with
/// the container manager's engine flavor.
pub(crate) async fn ensure_analysis_container(docker: &Docker) -> Result<String> {
    match docker
        .inspect_container(
            CONTAINER_NAME,
            None::<bollard::query_parameters::InspectContainerOptions>,
        )
        .await
    {
        Ok(existing) => {
            let id = existing.id.unwrap_or_else(|| CONTAINER_NAME.to_string());
            debug!(container = CONTAINER_NAME, "container already exists");
            return Ok(id);
        }
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(api_err(e)),
    }

    info!(container = CONTAINER_NAME, "creating analysis container");
    let config = ContainerCreateBody {
        image: Some(ANALYSIS_IMAGE.to_string()),
        entrypoint: Some(vec!["/bin/bash".to_string()]),
        tty: Some(true),
        open_stdin: Some(true),
        host_config: Some(HostConfig {
            // A named volume bind; the engine creates the volume on
            // first use.
            binds: Some(vec![format!("{VOLUME_NAME}:{ANALYSIS_DIR}")]),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    };

    let created = docker
        .create_container(
            Some(CreateContainerOptionsBuilder::new().name(CONTAINER_NAME).build()),
            config,
        )
        .await
        .map_err(api_err)?;

    docker
        .start_container(
            CONTAINER_NAME,
            None::<bollard::query_parameters::StartContainerOptions>,
        )
        .await
        .map_err(api_err)?;

    Ok(created.id)
}

pub(crate) fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}
