//! Backend provisioning engine.
//!
//! Turns a ranked backend into a usable analysis environment by walking a
//! fixed step sequence:
//!
//! ```text
//!   GuestCheck ──▶ InstallGuest ──▶ ConfigureGuest ──▶ PullImage ──▶ CreateWorkspace
//!                  (skipped when the guest already exists)
//! ```
//!
//! The flow is resumable, not transactional: a failed step leaves earlier
//! steps' effects in place, the environment moves to Degraded carrying the
//! failed step, and the next attempt resumes there. Every step is written
//! as a convergent "ensure X exists" check so partial effects from a prior
//! crash are detected rather than duplicated.

pub mod docker;
pub mod qemu;
pub mod wsl;

pub use self::docker::DockerDesktopDriver;
pub use self::qemu::QemuDriver;
pub use self::wsl::WslDriver;

use crate::capability::{self, BackendKind, HostCapability};
use crate::error::{Error, Result};
use crate::session::{ConnectionParams, EnvState, ProvisionedEnvironment, SessionState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Provisioning Steps
// =============================================================================

/// One step of the provisioning sequence.
///
/// Ordered; resuming a Degraded environment starts at the recorded step and
/// skips the completed ones (the guest check always re-runs, it is the
/// cheap convergence probe).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionStep {
    /// Does the guest (distro / engine / VM image) already exist?
    GuestCheck,
    /// Register the distro, import the VM image, or start Docker Desktop.
    InstallGuest,
    /// Install and start the container engine inside the guest.
    ConfigureGuest,
    /// Pull the analysis image.
    PullImage,
    /// Create the persistent volume and the long-lived container.
    CreateWorkspace,
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GuestCheck => write!(f, "guest-check"),
            Self::InstallGuest => write!(f, "install-guest"),
            Self::ConfigureGuest => write!(f, "configure-guest"),
            Self::PullImage => write!(f, "pull-image"),
            Self::CreateWorkspace => write!(f, "create-workspace"),
        }
    }
}

// =============================================================================
// Backend Driver Trait
// =============================================================================

/// Backend-specific implementation of the provisioning steps.
///
/// Drivers hold only connection details and shell out (or call the engine
/// API) per step; all sequencing, resume, and state bookkeeping lives in
/// [`Provisioner`].
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// The backend this driver provisions.
    fn kind(&self) -> BackendKind;

    /// Connection parameters the transport uses once the environment is
    /// Ready. Available before provisioning completes (they are fixed
    /// conventions, not discovered values).
    fn connection_params(&self) -> ConnectionParams;

    /// Verifies the host satisfies this backend's requirements.
    ///
    /// The default checks the static descriptor against the capability
    /// snapshot; the returned `UnsupportedHost` is the only error that
    /// permits falling back to the next-ranked backend.
    async fn check_host(&self, caps: &HostCapability) -> Result<()> {
        let desc = capability::descriptor(self.kind());
        for req in desc.requirements {
            if !caps.satisfies(*req) {
                return Err(Error::UnsupportedHost {
                    backend: self.kind().to_string(),
                    reason: format!("host lacks {req:?}"),
                });
            }
        }
        Ok(())
    }

    /// True if the guest already exists (registered distro, importable VM
    /// disk, reachable engine).
    async fn guest_present(&self) -> Result<bool>;

    /// Brings the guest into existence.
    async fn install_guest(&self) -> Result<()>;

    /// Ensures the container engine inside the guest is installed and
    /// running. Convergent: a no-op when already configured.
    async fn configure_guest(&self) -> Result<()>;

    /// Ensures the analysis image is present on the backend.
    async fn pull_image(&self) -> Result<()>;

    /// Ensures the persistent volume and the long-lived container exist.
    /// Returns `(volume_id, container_id)`.
    async fn create_workspace(&self) -> Result<(String, String)>;
}

/// Constructs the driver for a backend kind.
pub fn driver_for(kind: BackendKind) -> Box<dyn BackendDriver> {
    match kind {
        BackendKind::Wsl2 => Box::new(WslDriver::wsl2()),
        BackendKind::Wsl1 => Box::new(WslDriver::wsl1()),
        BackendKind::DockerDesktop => Box::new(DockerDesktopDriver::new()),
        BackendKind::Qemu => Box::new(QemuDriver::new()),
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Drives a [`BackendDriver`] through the step sequence and keeps the
/// session record in sync.
pub struct Provisioner {
    session: Arc<SessionState>,
}

impl Provisioner {
    pub fn new(session: Arc<SessionState>) -> Self {
        Self { session }
    }

    /// Provisions (or resumes) the environment on `driver`'s backend.
    ///
    /// Idempotent: a Ready environment on the same backend returns
    /// immediately without touching the driver. A Degraded one resumes at
    /// its recorded step. Any other active environment is a
    /// `StateConflict`; the caller must destroy it first.
    pub async fn provision(
        &self,
        driver: &dyn BackendDriver,
        caps: &HostCapability,
    ) -> Result<ProvisionedEnvironment> {
        if let Some(env) = self.session.snapshot() {
            if env.state == EnvState::Ready && env.backend == driver.kind() {
                debug!(backend = %env.backend, "environment already ready, nothing to do");
                return Ok(env);
            }
        }

        // Capability gate before any state mutation; this is the only path
        // that yields a fallback-eligible error.
        driver.check_host(caps).await?;

        let resume = self
            .session
            .begin_provisioning(driver.kind(), driver.connection_params())?;
        let start = resume.unwrap_or(ProvisionStep::GuestCheck);
        info!(backend = %driver.kind(), start = %start, "provisioning");

        match self.run_steps(driver, start).await {
            Ok((volume_id, container_id)) => {
                self.session.mark_ready(volume_id, container_id)?;
                info!(backend = %driver.kind(), "environment ready");
                self.session
                    .snapshot()
                    .ok_or_else(|| Error::Internal("session record vanished".to_string()))
            }
            Err(e) => {
                let failed_step = match &e {
                    Error::ProvisioningFailed { step, .. } => Some(*step),
                    _ => None,
                };
                warn!(backend = %driver.kind(), error = %e, "provisioning failed");
                self.session.mark_degraded(failed_step)?;
                Err(e)
            }
        }
    }

    /// Provisions the best backend the host supports.
    ///
    /// Iterates the ranked candidates; moves to the next only on
    /// `UnsupportedHost`. A step failure on a capability-satisfying backend
    /// is surfaced, never silently escalated to a lower-ranked backend.
    pub async fn provision_auto(
        &self,
        caps: &HostCapability,
    ) -> Result<ProvisionedEnvironment> {
        let ranked = capability::rank(caps);
        if ranked.is_empty() {
            return Err(Error::UnsupportedHost {
                backend: "any".to_string(),
                reason: "no backend requirements satisfied by this host".to_string(),
            });
        }

        let mut last = None;
        for desc in ranked {
            let driver = driver_for(desc.kind);
            match self.provision(driver.as_ref(), caps).await {
                Ok(env) => return Ok(env),
                Err(e) if e.allows_backend_fallback() => {
                    warn!(backend = %desc.kind, error = %e, "backend unsupported, trying next");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            Error::Internal("fallback loop exhausted without an error".to_string())
        }))
    }

    /// Walks the steps from `start`.
    ///
    /// The guest check always runs; it decides whether the install step is
    /// needed regardless of where the resume point is. The workspace step
    /// always runs because it is the step that yields the identifiers and
    /// is itself convergent.
    async fn run_steps(
        &self,
        driver: &dyn BackendDriver,
        start: ProvisionStep,
    ) -> Result<(String, String)> {
        let present = run_step(ProvisionStep::GuestCheck, driver.guest_present()).await?;

        if !present {
            run_step(ProvisionStep::InstallGuest, driver.install_guest()).await?;
        }
        if !present || start <= ProvisionStep::ConfigureGuest {
            run_step(ProvisionStep::ConfigureGuest, driver.configure_guest()).await?;
        }
        if !present || start <= ProvisionStep::PullImage {
            run_step(ProvisionStep::PullImage, driver.pull_image()).await?;
        }
        run_step(ProvisionStep::CreateWorkspace, driver.create_workspace()).await
    }
}

/// Runs one step, attributing any raw error to it.
async fn run_step<T>(
    step: ProvisionStep,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    debug!(step = %step, "provisioning step");
    fut.await.map_err(|e| match e {
        e @ Error::ProvisioningFailed { .. } => e,
        other => Error::ProvisioningFailed {
            step,
            reason: other.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_ordering() {
        assert!(ProvisionStep::GuestCheck < ProvisionStep::InstallGuest);
        assert!(ProvisionStep::ConfigureGuest < ProvisionStep::PullImage);
        assert!(ProvisionStep::PullImage < ProvisionStep::CreateWorkspace);
    }

    #[test]
    fn test_step_names() {
        assert_eq!(ProvisionStep::ConfigureGuest.to_string(), "configure-guest");
        assert_eq!(ProvisionStep::CreateWorkspace.to_string(), "create-workspace");
    }

    #[test]
    fn test_step_serde_kebab() {
        let json = serde_json::to_string(&ProvisionStep::PullImage).unwrap();
        assert_eq!(json, "\"pull-image\"");
        let back: ProvisionStep = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProvisionStep::PullImage);
    }
}
