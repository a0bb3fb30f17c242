//! Tests for the container manager: lifecycle bookkeeping, exec wrapping,
//! and the health-driven Ready/Degraded flip.

use async_trait::async_trait;
use fwbridge::{
    BackendKind, CommandResult, ConnectionParams, ContainerManager, ContainerOps, ContainerStatus,
    EnvState, Error, GuestCliOps, OutputChunk, OutputSink, RemoteCommand, SessionState, Transport,
    TransportBridge, TransferRequest,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Mocks
// =============================================================================

#[derive(Default)]
struct MockTransport {
    healthy: Arc<AtomicBool>,
    seen_argv: Arc<Mutex<Vec<Vec<String>>>>,
    /// Answer for in-container `test -e` checks.
    remote_file_exists: bool,
    /// Guest-side destinations of bridge uploads (staging hops).
    uploaded_to: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(
        &self,
        cmd: &RemoteCommand,
        sink: OutputSink,
        _cancel: CancellationToken,
    ) -> fwbridge::Result<CommandResult> {
        self.seen_argv.lock().unwrap().push(cmd.argv.clone());
        let _ = sink.send(OutputChunk::Stdout(b"ok".to_vec())).await;
        let is_exists_check = cmd.argv.iter().any(|a| a == "test");
        let exit_code = if is_exists_check && !self.remote_file_exists {
            1
        } else {
            0
        };
        Ok(CommandResult {
            exit_code,
            duration: Duration::from_millis(1),
        })
    }

    async fn upload(
        &self,
        req: &TransferRequest,
        _cancel: CancellationToken,
    ) -> fwbridge::Result<()> {
        self.uploaded_to
            .lock()
            .unwrap()
            .push(req.remote_path.clone());
        Ok(())
    }

    async fn download(
        &self,
        _req: &TransferRequest,
        _cancel: CancellationToken,
    ) -> fwbridge::Result<()> {
        Ok(())
    }

    async fn exists(&self, _remote_path: &str) -> fwbridge::Result<bool> {
        Ok(false)
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

struct MockOps {
    status: Mutex<ContainerStatus>,
}

impl MockOps {
    fn new(status: ContainerStatus) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }
}

#[async_trait]
impl ContainerOps for MockOps {
    async fn ensure(&self) -> fwbridge::Result<String> {
        *self.status.lock().unwrap() = ContainerStatus::Running;
        Ok("binwalkv3".to_string())
    }

    async fn start(&self) -> fwbridge::Result<()> {
        *self.status.lock().unwrap() = ContainerStatus::Running;
        Ok(())
    }

    async fn stop(&self) -> fwbridge::Result<()> {
        *self.status.lock().unwrap() = ContainerStatus::Stopped;
        Ok(())
    }

    async fn restart(&self) -> fwbridge::Result<()> {
        self.start().await
    }

    async fn remove(&self) -> fwbridge::Result<()> {
        *self.status.lock().unwrap() = ContainerStatus::NotFound;
        Ok(())
    }

    async fn status(&self) -> fwbridge::Result<ContainerStatus> {
        Ok(*self.status.lock().unwrap())
    }

    async fn logs(&self, _tail: usize) -> fwbridge::Result<String> {
        Ok("log line\n".to_string())
    }

    fn wrap_exec(&self, cmd: &RemoteCommand) -> RemoteCommand {
        let mut argv = vec!["docker".to_string(), "exec".to_string()];
        argv.extend(cmd.argv.iter().cloned());
        RemoteCommand {
            argv,
            working_dir: None,
            timeout: cmd.timeout,
        }
    }

    async fn transfer(
        &self,
        _req: &TransferRequest,
        _cancel: &CancellationToken,
    ) -> fwbridge::Result<()> {
        Ok(())
    }
}

fn ready_session(dir: &TempDir) -> Arc<SessionState> {
    let session = Arc::new(
        SessionState::with_store_path(dir.path().join("session.json")).unwrap(),
    );
    session
        .begin_provisioning(
            BackendKind::Wsl2,
            ConnectionParams::Wsl {
                distro: "kali-linux".to_string(),
            },
        )
        .unwrap();
    session
        .mark_ready("binwalkv3".to_string(), "abc".to_string())
        .unwrap();
    session
}

fn manager_with(
    session: Arc<SessionState>,
    status: ContainerStatus,
    healthy: bool,
) -> (ContainerManager, Arc<Mutex<Vec<Vec<String>>>>) {
    let transport = MockTransport {
        healthy: Arc::new(AtomicBool::new(healthy)),
        ..Default::default()
    };
    let seen = transport.seen_argv.clone();
    let bridge = Arc::new(TransportBridge::new(Arc::new(transport)));
    let manager = ContainerManager::with_ops(session, bridge, Box::new(MockOps::new(status)));
    (manager, seen)
}

// =============================================================================
// Lifecycle Bookkeeping
// =============================================================================

#[tokio::test]
async fn test_ensure_records_container_id() {
    let dir = TempDir::new().unwrap();
    let session = ready_session(&dir);
    session.set_container(None).unwrap();
    let (manager, _) = manager_with(session.clone(), ContainerStatus::NotFound, true);

    let id = manager.ensure_container().await.unwrap();
    assert_eq!(id, "binwalkv3");
    assert_eq!(
        session.snapshot().unwrap().container_id.as_deref(),
        Some("binwalkv3")
    );
    assert_eq!(manager.status().await.unwrap(), ContainerStatus::Running);
}

#[tokio::test]
async fn test_remove_clears_container_id() {
    let dir = TempDir::new().unwrap();
    let session = ready_session(&dir);
    let (manager, _) = manager_with(session.clone(), ContainerStatus::Running, true);

    manager.remove().await.unwrap();
    assert!(session.snapshot().unwrap().container_id.is_none());
    assert_eq!(manager.status().await.unwrap(), ContainerStatus::NotFound);
    // The environment itself is untouched.
    assert_eq!(session.state(), EnvState::Ready);
}

// =============================================================================
// Exec Wrapping
// =============================================================================

#[tokio::test]
async fn test_execute_goes_through_wrap() {
    let dir = TempDir::new().unwrap();
    let session = ready_session(&dir);
    let (manager, seen) = manager_with(session, ContainerStatus::Running, true);

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let cancel = CancellationToken::new();
    let result = manager
        .execute(&RemoteCommand::new(["binwalk", "fw.bin"]), tx, &cancel)
        .await
        .unwrap();
    let _ = drain.await;

    assert!(result.is_success());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], vec!["docker", "exec", "binwalk", "fw.bin"]);
}

// =============================================================================
// Guest CLI Transfers
// =============================================================================

fn guest_cli_with(
    remote_file_exists: bool,
) -> (
    GuestCliOps,
    Arc<Mutex<Vec<Vec<String>>>>,
    Arc<Mutex<Vec<String>>>,
) {
    let transport = MockTransport {
        remote_file_exists,
        ..Default::default()
    };
    let seen = transport.seen_argv.clone();
    let uploads = transport.uploaded_to.clone();
    let bridge = Arc::new(TransportBridge::new(Arc::new(transport)));
    (GuestCliOps::new(bridge, false), seen, uploads)
}

fn ran_docker_cp(seen: &Mutex<Vec<Vec<String>>>) -> bool {
    seen.lock()
        .unwrap()
        .iter()
        .any(|argv| argv.contains(&"cp".to_string()))
}

#[tokio::test]
async fn test_container_upload_conflict_without_overwrite() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = dir.path().join("firmware.bin");
    std::fs::write(&source, b"payload").unwrap();

    let (ops, seen, uploads) = guest_cli_with(true);
    let cancel = CancellationToken::new();
    let err = ops
        .transfer(
            &TransferRequest::upload(&source, "/analysis/firmware.bin"),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PathConflict { .. }));

    // No byte moved toward the container: no staging hop, no docker cp.
    assert!(uploads.lock().unwrap().is_empty());
    assert!(!ran_docker_cp(&seen));
}

#[tokio::test]
async fn test_container_upload_overwrite_runs_copy() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = dir.path().join("firmware.bin");
    std::fs::write(&source, b"payload").unwrap();

    let (ops, seen, uploads) = guest_cli_with(true);
    let cancel = CancellationToken::new();
    ops.transfer(
        &TransferRequest::upload(&source, "/analysis/firmware.bin").overwrite(true),
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(uploads.lock().unwrap().len(), 1);
    assert!(ran_docker_cp(&seen));
}

#[tokio::test]
async fn test_container_upload_fresh_path_proceeds() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = dir.path().join("firmware.bin");
    std::fs::write(&source, b"payload").unwrap();

    let (ops, seen, uploads) = guest_cli_with(false);
    let cancel = CancellationToken::new();
    ops.transfer(
        &TransferRequest::upload(&source, "/analysis/firmware.bin"),
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(uploads.lock().unwrap().len(), 1);
    assert!(ran_docker_cp(&seen));
}

#[tokio::test]
async fn test_staging_paths_are_distinct_for_same_file_name() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = dir.path().join("firmware.bin");
    std::fs::write(&source, b"payload").unwrap();

    let (ops, _seen, uploads) = guest_cli_with(false);
    let cancel = CancellationToken::new();
    for _ in 0..2 {
        ops.transfer(
            &TransferRequest::upload(&source, "/analysis/firmware.bin").overwrite(true),
            &cancel,
        )
        .await
        .unwrap();
    }

    let staged = uploads.lock().unwrap();
    assert_eq!(staged.len(), 2);
    assert_ne!(staged[0], staged[1]);
    assert!(staged.iter().all(|p| p.ends_with("firmware.bin")));
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_flip_and_fail_fast() {
    let dir = TempDir::new().unwrap();
    let session = ready_session(&dir);
    let (manager, _) = manager_with(session.clone(), ContainerStatus::Running, false);

    assert!(!manager.health_check().await);
    assert_eq!(session.state(), EnvState::Degraded);
    assert!(manager.bridge().is_degraded());

    // Commands fail fast against the degraded bridge.
    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let cancel = CancellationToken::new();
    let err = manager
        .execute(&RemoteCommand::new(["binwalk"]), tx, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransportUnavailable(_)));
}

#[tokio::test]
async fn test_health_recovery_flips_back() {
    let dir = TempDir::new().unwrap();
    let session = ready_session(&dir);
    session.mark_degraded(None).unwrap();
    let (manager, _) = manager_with(session.clone(), ContainerStatus::Running, true);

    assert!(manager.health_check().await);
    assert_eq!(session.state(), EnvState::Ready);
    assert!(!manager.bridge().is_degraded());
}

#[tokio::test]
async fn test_stopped_container_is_unhealthy() {
    let dir = TempDir::new().unwrap();
    let session = ready_session(&dir);
    let (manager, _) = manager_with(session.clone(), ContainerStatus::Stopped, true);

    assert!(!manager.health_check().await);
    assert_eq!(session.state(), EnvState::Degraded);
}
