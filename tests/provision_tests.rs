//! Tests for the provisioning engine: idempotence, resumability, and the
//! fallback policy, driven through a call-counting mock driver.

use async_trait::async_trait;
use fwbridge::{
    BackendDriver, BackendKind, ConnectionParams, EnvState, Error, HostCapability, ProvisionStep,
    Provisioner, SessionState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Mock Driver
// =============================================================================

#[derive(Default)]
struct Calls {
    guest_present: AtomicUsize,
    install_guest: AtomicUsize,
    configure_guest: AtomicUsize,
    pull_image: AtomicUsize,
    create_workspace: AtomicUsize,
}

struct MockDriver {
    calls: Arc<Calls>,
    guest_present: bool,
    fail_at: Option<ProvisionStep>,
}

impl MockDriver {
    fn new(calls: Arc<Calls>) -> Self {
        Self {
            calls,
            guest_present: false,
            fail_at: None,
        }
    }

    fn present(mut self) -> Self {
        self.guest_present = true;
        self
    }

    fn failing_at(mut self, step: ProvisionStep) -> Self {
        self.fail_at = Some(step);
        self
    }

    fn fail_if(&self, step: ProvisionStep) -> fwbridge::Result<()> {
        if self.fail_at == Some(step) {
            return Err(Error::CommandFailed(format!("injected failure at {step}")));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendDriver for MockDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Wsl2
    }

    fn connection_params(&self) -> ConnectionParams {
        ConnectionParams::Wsl {
            distro: "kali-linux".to_string(),
        }
    }

    async fn guest_present(&self) -> fwbridge::Result<bool> {
        self.calls.guest_present.fetch_add(1, Ordering::SeqCst);
        self.fail_if(ProvisionStep::GuestCheck)?;
        Ok(self.guest_present)
    }

    async fn install_guest(&self) -> fwbridge::Result<()> {
        self.calls.install_guest.fetch_add(1, Ordering::SeqCst);
        self.fail_if(ProvisionStep::InstallGuest)
    }

    async fn configure_guest(&self) -> fwbridge::Result<()> {
        self.calls.configure_guest.fetch_add(1, Ordering::SeqCst);
        self.fail_if(ProvisionStep::ConfigureGuest)
    }

    async fn pull_image(&self) -> fwbridge::Result<()> {
        self.calls.pull_image.fetch_add(1, Ordering::SeqCst);
        self.fail_if(ProvisionStep::PullImage)
    }

    async fn create_workspace(&self) -> fwbridge::Result<(String, String)> {
        self.calls.create_workspace.fetch_add(1, Ordering::SeqCst);
        self.fail_if(ProvisionStep::CreateWorkspace)?;
        Ok(("binwalkv3".to_string(), "container-id".to_string()))
    }
}

fn wsl2_caps() -> HostCapability {
    HostCapability {
        wsl2_available: true,
        wsl1_available: true,
        ..Default::default()
    }
}

fn provisioner_in(dir: &TempDir) -> (Provisioner, Arc<SessionState>) {
    let session = Arc::new(
        SessionState::with_store_path(dir.path().join("session.json")).unwrap(),
    );
    (Provisioner::new(session.clone()), session)
}

// =============================================================================
// Fresh Provisioning
// =============================================================================

#[tokio::test]
async fn test_fresh_provision_runs_all_steps() {
    let dir = TempDir::new().unwrap();
    let (provisioner, session) = provisioner_in(&dir);
    let calls = Arc::new(Calls::default());
    let driver = MockDriver::new(calls.clone());

    let env = provisioner.provision(&driver, &wsl2_caps()).await.unwrap();

    assert_eq!(env.state, EnvState::Ready);
    assert_eq!(env.volume_id.as_deref(), Some("binwalkv3"));
    assert_eq!(env.container_id.as_deref(), Some("container-id"));
    assert_eq!(session.state(), EnvState::Ready);

    assert_eq!(calls.guest_present.load(Ordering::SeqCst), 1);
    assert_eq!(calls.install_guest.load(Ordering::SeqCst), 1);
    assert_eq!(calls.configure_guest.load(Ordering::SeqCst), 1);
    assert_eq!(calls.pull_image.load(Ordering::SeqCst), 1);
    assert_eq!(calls.create_workspace.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_existing_guest_skips_install() {
    let dir = TempDir::new().unwrap();
    let (provisioner, _) = provisioner_in(&dir);
    let calls = Arc::new(Calls::default());
    let driver = MockDriver::new(calls.clone()).present();

    provisioner.provision(&driver, &wsl2_caps()).await.unwrap();
    assert_eq!(calls.install_guest.load(Ordering::SeqCst), 0);
    assert_eq!(calls.configure_guest.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn test_ready_environment_makes_zero_driver_calls() {
    let dir = TempDir::new().unwrap();
    let (provisioner, _) = provisioner_in(&dir);

    let first = Arc::new(Calls::default());
    provisioner
        .provision(&MockDriver::new(first.clone()).present(), &wsl2_caps())
        .await
        .unwrap();

    let second = Arc::new(Calls::default());
    let env = provisioner
        .provision(&MockDriver::new(second.clone()).present(), &wsl2_caps())
        .await
        .unwrap();

    assert_eq!(env.state, EnvState::Ready);
    assert_eq!(second.guest_present.load(Ordering::SeqCst), 0);
    assert_eq!(second.install_guest.load(Ordering::SeqCst), 0);
    assert_eq!(second.configure_guest.load(Ordering::SeqCst), 0);
    assert_eq!(second.pull_image.load(Ordering::SeqCst), 0);
    assert_eq!(second.create_workspace.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Failure and Resume
// =============================================================================

#[tokio::test]
async fn test_step_failure_records_step_and_degrades() {
    let dir = TempDir::new().unwrap();
    let (provisioner, session) = provisioner_in(&dir);
    let calls = Arc::new(Calls::default());
    let driver = MockDriver::new(calls.clone())
        .present()
        .failing_at(ProvisionStep::PullImage);

    let err = provisioner
        .provision(&driver, &wsl2_caps())
        .await
        .unwrap_err();

    match &err {
        Error::ProvisioningFailed { step, .. } => assert_eq!(*step, ProvisionStep::PullImage),
        other => panic!("unexpected error: {other}"),
    }
    // Step failures never justify a backend fallback.
    assert!(!err.allows_backend_fallback());

    let env = session.snapshot().unwrap();
    assert_eq!(env.state, EnvState::Degraded);
    assert_eq!(env.failed_step, Some(ProvisionStep::PullImage));
}

#[tokio::test]
async fn test_resume_skips_completed_steps() {
    let dir = TempDir::new().unwrap();
    let (provisioner, session) = provisioner_in(&dir);

    let first = Arc::new(Calls::default());
    let failing = MockDriver::new(first.clone())
        .present()
        .failing_at(ProvisionStep::PullImage);
    provisioner
        .provision(&failing, &wsl2_caps())
        .await
        .unwrap_err();

    // Retry with a healthy driver: the guest check re-runs (convergence
    // probe), configure is already done, pull resumes.
    let second = Arc::new(Calls::default());
    let healthy = MockDriver::new(second.clone()).present();
    let env = provisioner.provision(&healthy, &wsl2_caps()).await.unwrap();

    assert_eq!(env.state, EnvState::Ready);
    assert!(env.failed_step.is_none());
    assert_eq!(session.state(), EnvState::Ready);

    assert_eq!(second.guest_present.load(Ordering::SeqCst), 1);
    assert_eq!(second.install_guest.load(Ordering::SeqCst), 0);
    assert_eq!(second.configure_guest.load(Ordering::SeqCst), 0);
    assert_eq!(second.pull_image.load(Ordering::SeqCst), 1);
    assert_eq!(second.create_workspace.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Capability Gate
// =============================================================================

#[tokio::test]
async fn test_unsupported_host_allows_fallback_and_leaves_state_untouched() {
    let dir = TempDir::new().unwrap();
    let (provisioner, session) = provisioner_in(&dir);
    let calls = Arc::new(Calls::default());
    let driver = MockDriver::new(calls.clone());

    let bare = HostCapability::default();
    let err = provisioner.provision(&driver, &bare).await.unwrap_err();

    assert!(matches!(err, Error::UnsupportedHost { .. }));
    assert!(err.allows_backend_fallback());
    assert_eq!(session.state(), EnvState::Absent);
    assert_eq!(calls.guest_present.load(Ordering::SeqCst), 0);
}
