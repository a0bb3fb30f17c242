//! Tests for the transport bridge: streaming order, exec serialization,
//! timeout enforcement, transfer semantics, and the degraded fail-fast,
//! all through an in-memory mock transport.

use async_trait::async_trait;
use fwbridge::{
    CommandResult, Error, OutputChunk, OutputSink, RemoteCommand, Transport, TransportBridge,
    TransferRequest,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Mock Transport
// =============================================================================

#[derive(Default)]
struct MockState {
    /// Remote-path → bytes loopback store.
    files: HashMap<String, Vec<u8>>,
    /// (start, end) of every execute call.
    exec_spans: Vec<(Instant, Instant)>,
    upload_calls: usize,
}

#[derive(Default)]
struct MockTransport {
    state: Arc<Mutex<MockState>>,
    /// Each execute sleeps this long between start and end.
    exec_delay: Duration,
    /// Execute never returns until cancelled.
    hang: bool,
    /// Transfers never return until cancelled.
    hang_transfer: bool,
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
        cancel: CancellationToken,
    ) -> fwbridge::Result<CommandResult> {
        let start = Instant::now();
        if self.hang {
            cancel.cancelled().await;
            return Err(Error::Cancelled(cmd.describe()));
        }

        // Echo each argv element back as one stdout chunk, in order.
        for arg in &cmd.argv {
            let _ = sink
                .send(OutputChunk::Stdout(arg.as_bytes().to_vec()))
                .await;
        }
        let _ = sink.send(OutputChunk::Stderr(b"done".to_vec())).await;

        tokio::time::sleep(self.exec_delay).await;
        let end = Instant::now();
        self.state.lock().unwrap().exec_spans.push((start, end));
        Ok(CommandResult {
            exit_code: 0,
            duration: end - start,
        })
    }

    async fn upload(&self, req: &TransferRequest, cancel: CancellationToken) -> fwbridge::Result<()> {
        if self.hang_transfer {
            cancel.cancelled().await;
            return Err(Error::Cancelled(req.remote_path.clone()));
        }
        let bytes = std::fs::read(&req.local_path)?;
        let mut state = self.state.lock().unwrap();
        state.upload_calls += 1;
        state.files.insert(req.remote_path.clone(), bytes);
        Ok(())
    }

    async fn download(&self, req: &TransferRequest, cancel: CancellationToken) -> fwbridge::Result<()> {
        if self.hang_transfer {
            cancel.cancelled().await;
            return Err(Error::Cancelled(req.remote_path.clone()));
        }
        let bytes = {
            let state = self.state.lock().unwrap();
            state
                .files
                .get(&req.remote_path)
                .cloned()
                .ok_or_else(|| Error::TransferFailed {
                    path: req.remote_path.clone(),
                    reason: "no such remote file".to_string(),
                })?
        };
        std::fs::write(&req.local_path, bytes)?;
        Ok(())
    }

    async fn exists(&self, remote_path: &str) -> fwbridge::Result<bool> {
        Ok(self.state.lock().unwrap().files.contains_key(remote_path))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn bridge_with(transport: MockTransport) -> (TransportBridge, Arc<Mutex<MockState>>) {
    let state = transport.state.clone();
    (TransportBridge::new(Arc::new(transport)), state)
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test]
async fn test_stdout_chunks_arrive_in_order() {
    let (bridge, _) = bridge_with(MockTransport::default());
    let cmd = RemoteCommand::new(["one", "two", "three"]);
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let cancel = CancellationToken::new();

    let result = bridge.execute(&cmd, tx, &cancel).await.unwrap();
    assert!(result.is_success());

    let mut stdout = Vec::new();
    while let Some(chunk) = rx.recv().await {
        if let OutputChunk::Stdout(bytes) = chunk {
            stdout.push(String::from_utf8(bytes).unwrap());
        }
    }
    assert_eq!(stdout, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_run_captured_splits_streams() {
    let (bridge, _) = bridge_with(MockTransport::default());
    let cmd = RemoteCommand::new(["hello"]);
    let (result, stdout, stderr) = bridge.run_captured(&cmd).await.unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(stdout, "hello");
    assert_eq!(stderr, "done");
}

// =============================================================================
// Exec Serialization
// =============================================================================

#[tokio::test]
async fn test_executes_do_not_overlap() {
    let (bridge, state) = bridge_with(MockTransport {
        exec_delay: Duration::from_millis(50),
        ..Default::default()
    });
    let bridge = Arc::new(bridge);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let bridge = bridge.clone();
        handles.push(tokio::spawn(async move {
            let (tx, mut rx) = tokio::sync::mpsc::channel(16);
            let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
            let cancel = CancellationToken::new();
            bridge
                .execute(&RemoteCommand::new(["task"]), tx, &cancel)
                .await
                .unwrap();
            let _ = drain.await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let spans = state.lock().unwrap().exec_spans.clone();
    assert_eq!(spans.len(), 3);
    let mut ordered = spans.clone();
    ordered.sort_by_key(|(start, _)| *start);
    for pair in ordered.windows(2) {
        // The previous command finished before the next one started.
        assert!(pair[0].1 <= pair[1].0, "execute calls overlapped");
    }
}

// =============================================================================
// Timeout and Degraded
// =============================================================================

#[tokio::test]
async fn test_timeout_is_bounded_and_cancels() {
    let (bridge, _) = bridge_with(MockTransport {
        hang: true,
        ..Default::default()
    });
    let cmd = RemoteCommand::new(["sleepy"]).timeout(Duration::from_millis(100));
    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let err = bridge.execute(&cmd, tx, &cancel).await.unwrap_err();
    match err {
        Error::Timeout { duration, .. } => assert_eq!(duration, Duration::from_millis(100)),
        other => panic!("unexpected error: {other}"),
    }
    // Bounded: the cooperative mock stops on cancellation, so the call
    // returns near the deadline rather than hanging.
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_degraded_bridge_fails_fast() {
    let (bridge, _) = bridge_with(MockTransport::default());
    bridge.set_degraded(true);

    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let cancel = CancellationToken::new();
    let err = bridge
        .execute(&RemoteCommand::new(["anything"]), tx, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransportUnavailable(_)));

    bridge.set_degraded(false);
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let cancel = CancellationToken::new();
    assert!(bridge
        .execute(&RemoteCommand::new(["anything"]), tx, &cancel)
        .await
        .is_ok());
    let _ = drain.await;
}

// =============================================================================
// Transfers
// =============================================================================

#[tokio::test]
async fn test_upload_download_round_trip() {
    let (bridge, _) = bridge_with(MockTransport::default());
    let dir = TempDir::new().unwrap();

    let source = dir.path().join("firmware.bin");
    let payload: Vec<u8> = (0u16..4096).map(|i| (i % 251) as u8).collect();
    std::fs::write(&source, &payload).unwrap();

    let cancel = CancellationToken::new();
    bridge
        .transfer(&TransferRequest::upload(&source, "/analysis/firmware.bin"), &cancel)
        .await
        .unwrap();

    let target = dir.path().join("copy.bin");
    bridge
        .transfer(&TransferRequest::download("/analysis/firmware.bin", &target), &cancel)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), payload);
}

#[tokio::test]
async fn test_upload_conflict_without_overwrite() {
    let (bridge, state) = bridge_with(MockTransport::default());
    state
        .lock()
        .unwrap()
        .files
        .insert("/analysis/firmware.bin".to_string(), b"original".to_vec());

    let dir = TempDir::new().unwrap();
    let source = dir.path().join("firmware.bin");
    std::fs::write(&source, b"replacement").unwrap();

    let cancel = CancellationToken::new();
    let err = bridge
        .transfer(&TransferRequest::upload(&source, "/analysis/firmware.bin"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PathConflict { .. }));

    // No byte moved: destination unchanged, the transport was never asked
    // to write.
    let state = state.lock().unwrap();
    assert_eq!(state.files["/analysis/firmware.bin"], b"original");
    assert_eq!(state.upload_calls, 0);
}

#[tokio::test]
async fn test_download_conflict_without_overwrite() {
    let (bridge, state) = bridge_with(MockTransport::default());
    state
        .lock()
        .unwrap()
        .files
        .insert("/analysis/out.log".to_string(), b"remote".to_vec());

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("out.log");
    std::fs::write(&target, b"local").unwrap();

    let cancel = CancellationToken::new();
    let err = bridge
        .transfer(&TransferRequest::download("/analysis/out.log", &target), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PathConflict { .. }));
    assert_eq!(std::fs::read(&target).unwrap(), b"local");

    // With overwrite the same transfer succeeds.
    bridge
        .transfer(
            &TransferRequest::download("/analysis/out.log", &target).overwrite(true),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), b"remote");
}

#[tokio::test]
async fn test_transfers_bypass_exec_queue() {
    let (bridge, _) = bridge_with(MockTransport {
        hang: true,
        ..Default::default()
    });
    let bridge = Arc::new(bridge);

    // Occupy the exec lane indefinitely.
    let busy = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let (tx, _rx) = tokio::sync::mpsc::channel(16);
            let cancel = CancellationToken::new();
            let cmd = RemoteCommand::new(["forever"]).timeout(Duration::from_secs(5));
            let _ = bridge.execute(&cmd, tx, &cancel).await;
        })
    };

    // A transfer completes while the exec is still in flight.
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("f.bin");
    std::fs::write(&source, b"data").unwrap();
    let cancel = CancellationToken::new();
    tokio::time::timeout(
        Duration::from_secs(1),
        bridge.transfer(&TransferRequest::upload(&source, "/analysis/f.bin"), &cancel),
    )
    .await
    .expect("transfer queued behind execute")
    .unwrap();

    busy.abort();
}

#[tokio::test]
async fn test_transfer_cancellation_is_prompt() {
    let (bridge, state) = bridge_with(MockTransport {
        hang_transfer: true,
        ..Default::default()
    });
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("f.bin");
    std::fs::write(&source, b"data").unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = bridge
        .transfer(&TransferRequest::upload(&source, "/analysis/f.bin"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
    // Bounded: the cancellation aborts the transfer rather than waiting
    // for it to finish on its own.
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(state.lock().unwrap().files.is_empty());
}
