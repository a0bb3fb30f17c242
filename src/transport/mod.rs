//! Transport bridge - uniform remote command/file surface.
//!
//! A [`Transport`] turns one connection flavor (in-guest exec, SSH, local
//! engine socket) into the same narrow interface: streamed command
//! execution, whole-file transfer, and a lightweight liveness probe. The
//! [`TransportBridge`] wraps a transport and owns the cross-cutting
//! semantics every flavor shares:
//!
//! - one in-flight `execute` per container, queued behind an async mutex
//!   (transfers and health checks bypass the queue);
//! - timeout enforcement with best-effort remote cancellation;
//! - fail-fast on a degraded environment once a queued call reaches the
//!   front of the queue;
//! - destination conflict checks before any transfer byte moves.

pub mod docker;
pub mod ssh;
pub mod wsl;

pub use self::docker::DockerTransport;
pub use self::ssh::SshTransport;
pub use self::wsl::WslTransport;

use crate::command::{CommandResult, OutputChunk, OutputSink, RemoteCommand, TransferDirection, TransferRequest};
use crate::constants::{HEALTH_CHECK_TIMEOUT, MAX_CONTROL_OUTPUT, OUTPUT_CHANNEL_CAPACITY, OUTPUT_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::session::ConnectionParams;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace period for a transport to reap the remote side after a timeout
/// fires, before the bridge gives up on it.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Transport Trait
// =============================================================================

/// One connection flavor to a provisioned guest.
///
/// Implementations map cancellation of the supplied token to their
/// termination primitive: guest process kill, SSH channel close, or engine
/// API abort. Cancellation is cooperative for the remote process - a local
/// kill does not guarantee the remote side stopped, so callers should
/// health-check after cancelling before reuse.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Runs a command, mirroring output chunks into `sink` as produced.
    ///
    /// Chunks of one stream are delivered in order; interleaving between
    /// stdout and stderr is best-effort. The transport does not enforce
    /// `cmd.timeout` - the bridge does.
    async fn execute(
        &self,
        cmd: &RemoteCommand,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<CommandResult>;

    /// Copies the local file to the remote path, replacing it if present.
    /// Conflict checks happen in the bridge before this is called.
    /// Cancellation maps to the same primitive as `execute`: local child
    /// kill or stream detach.
    async fn upload(&self, req: &TransferRequest, cancel: CancellationToken) -> Result<()>;

    /// Copies the remote path to the local file. A cancelled or failed
    /// download must not leave a partial destination behind.
    async fn download(&self, req: &TransferRequest, cancel: CancellationToken) -> Result<()>;

    /// True if the remote path exists.
    async fn exists(&self, remote_path: &str) -> Result<bool>;

    /// Lightweight liveness probe on its own channel.
    async fn health_check(&self) -> bool;
}

// =============================================================================
// Transport Bridge
// =============================================================================

/// Uniform front door over whichever transport was provisioned.
pub struct TransportBridge {
    inner: Arc<dyn Transport>,
    /// Serializes `execute` calls: one in-flight command per container.
    exec_lock: Mutex<()>,
    /// Set by health checks; queued commands fail fast once they reach
    /// the front of the queue instead of running against a dead guest.
    degraded: AtomicBool,
}

impl TransportBridge {
    /// Wraps an already-constructed transport.
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            exec_lock: Mutex::new(()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Builds the transport matching `params`.
    pub fn connect(params: &ConnectionParams) -> Result<Self> {
        let inner: Arc<dyn Transport> = match params {
            ConnectionParams::Wsl { distro } => Arc::new(WslTransport::new(distro.clone())),
            ConnectionParams::Ssh {
                host,
                port,
                user,
                identity_file,
            } => Arc::new(SshTransport::new(
                host.clone(),
                *port,
                user.clone(),
                identity_file.clone(),
            )),
            ConnectionParams::DockerSocket { socket_path } => Arc::new(DockerTransport::connect(
                socket_path.as_deref(),
                crate::constants::CONTAINER_NAME,
            )?),
        };
        Ok(Self::new(inner))
    }

    /// Transport name for logs.
    pub fn transport_name(&self) -> &str {
        self.inner.name()
    }

    /// Marks the bridge (un)available; driven by health checks.
    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    /// Current availability flag.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Runs a command with streamed output.
    ///
    /// Queued behind any in-flight `execute`; honors `cmd.timeout` by
    /// cancelling the transport's child token and returning
    /// [`Error::Timeout`] instead of blocking the caller indefinitely.
    pub async fn execute(
        &self,
        cmd: &RemoteCommand,
        sink: OutputSink,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let _guard = self.exec_lock.lock().await;
        if self.is_degraded() {
            return Err(Error::TransportUnavailable(
                "environment is degraded; re-run a health check before use".to_string(),
            ));
        }
        self.run_with_deadline(cmd, sink, cancel).await
    }

    /// Runs a command without queueing (control channel).
    ///
    /// Used for lifecycle commands and health-adjacent probes that must not
    /// wait behind a long analysis run. Output is captured and truncated to
    /// [`MAX_CONTROL_OUTPUT`].
    pub async fn run_captured(&self, cmd: &RemoteCommand) -> Result<(CommandResult, String, String)> {
        let (tx, mut rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let collector = tokio::spawn(async move {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Some(chunk) = rx.recv().await {
                let (buf, bytes) = match &chunk {
                    OutputChunk::Stdout(b) => (&mut stdout, b),
                    OutputChunk::Stderr(b) => (&mut stderr, b),
                };
                if buf.len() < MAX_CONTROL_OUTPUT {
                    buf.extend_from_slice(bytes);
                }
            }
            stdout.truncate(MAX_CONTROL_OUTPUT);
            stderr.truncate(MAX_CONTROL_OUTPUT);
            (stdout, stderr)
        });

        let cancel = CancellationToken::new();
        let result = self.run_with_deadline(cmd, tx, &cancel).await;
        let (stdout, stderr) = collector
            .await
            .map_err(|e| Error::Internal(format!("output collector failed: {e}")))?;
        let result = result?;
        Ok((
            result,
            String::from_utf8_lossy(&stdout).to_string(),
            String::from_utf8_lossy(&stderr).to_string(),
        ))
    }

    async fn run_with_deadline(
        &self,
        cmd: &RemoteCommand,
        sink: OutputSink,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let child_token = cancel.child_token();
        let fut = self.inner.execute(cmd, sink, child_token.clone());
        tokio::pin!(fut);

        match cmd.timeout {
            None => fut.await,
            Some(limit) => {
                tokio::select! {
                    res = &mut fut => res,
                    _ = tokio::time::sleep(limit) => {
                        debug!(operation = %cmd.describe(), ?limit, "command deadline expired, cancelling");
                        child_token.cancel();
                        // Best-effort reap; the remote side may outlive us.
                        let _ = tokio::time::timeout(CANCEL_GRACE, &mut fut).await;
                        Err(Error::Timeout {
                            operation: cmd.describe(),
                            duration: limit,
                        })
                    }
                }
            }
        }
    }

    /// Performs a whole-file transfer, dispatching on direction.
    ///
    /// Safe to call while a command is in flight: transfers use their own
    /// channel/connection and never queue behind `execute`. The token
    /// aborts an in-flight transfer the same way it aborts a command.
    pub async fn transfer(&self, req: &TransferRequest, cancel: &CancellationToken) -> Result<()> {
        match req.direction {
            TransferDirection::Upload => {
                if !req.local_path.is_file() {
                    return Err(Error::TransferFailed {
                        path: req.local_path.display().to_string(),
                        reason: "local source is not a file".to_string(),
                    });
                }
                if !req.overwrite && self.inner.exists(&req.remote_path).await? {
                    return Err(Error::PathConflict {
                        path: req.remote_path.clone(),
                    });
                }
                self.inner.upload(req, cancel.child_token()).await
            }
            TransferDirection::Download => {
                if !req.overwrite && req.local_path.exists() {
                    return Err(Error::PathConflict {
                        path: req.local_path.display().to_string(),
                    });
                }
                self.inner.download(req, cancel.child_token()).await
            }
        }
    }

    /// Uploads a host file to the guest.
    pub async fn upload(&self, req: &TransferRequest, cancel: &CancellationToken) -> Result<()> {
        debug_assert!(matches!(req.direction, TransferDirection::Upload));
        self.transfer(req, cancel).await
    }

    /// Downloads a guest path to the host.
    pub async fn download(&self, req: &TransferRequest, cancel: &CancellationToken) -> Result<()> {
        debug_assert!(matches!(req.direction, TransferDirection::Download));
        self.transfer(req, cancel).await
    }

    /// Lightweight liveness probe; never waits behind a queued `execute`.
    pub async fn health_check(&self) -> bool {
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.inner.health_check()).await {
            Ok(alive) => alive,
            Err(_) => {
                warn!(transport = self.inner.name(), "health check timed out");
                false
            }
        }
    }
}

// =============================================================================
// Shared Process Streaming
// =============================================================================

/// Spawns `command` and mirrors its stdout/stderr into `sink` chunk by
/// chunk. Shared by the process-backed transports (`wsl.exe`, `ssh`).
///
/// Cancellation kills the local child (`kill_on_drop` backs this up); the
/// remote process may survive a transport-level kill.
pub(crate) async fn stream_child(
    mut command: tokio::process::Command,
    sink: OutputSink,
    cancel: CancellationToken,
    operation: &str,
) -> Result<CommandResult> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = command.spawn().map_err(|e| {
        Error::TransportUnavailable(format!("failed to spawn {operation}: {e}"))
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_pump = tokio::spawn(pump_stream(stdout, sink.clone(), true));
    let err_pump = tokio::spawn(pump_stream(stderr, sink, false));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            debug!(operation, "cancellation requested, killing local child");
            let _ = child.start_kill();
            let _ = child.wait().await;
            out_pump.abort();
            err_pump.abort();
            return Err(Error::Cancelled(operation.to_string()));
        }
    };

    // Drain remaining buffered output before reporting the result.
    let _ = out_pump.await;
    let _ = err_pump.await;

    Ok(CommandResult {
        exit_code: status.code().unwrap_or(-1),
        duration: start.elapsed(),
    })
}

/// Reads one stream to EOF, forwarding chunks.
///
/// A dropped receiver stops mirroring but keeps draining so the child can
/// exit without blocking on a full pipe.
async fn pump_stream<R>(stream: Option<R>, sink: OutputSink, is_stdout: bool)
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let Some(mut stream) = stream else { return };
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    let mut mirror = true;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if mirror {
                    let chunk = if is_stdout {
                        OutputChunk::Stdout(buf[..n].to_vec())
                    } else {
                        OutputChunk::Stderr(buf[..n].to_vec())
                    };
                    if sink.send(chunk).await.is_err() {
                        mirror = false;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Shell Quoting
// =============================================================================

/// Single-quote escapes a string for `sh -c` composition.
///
/// Every remote argv element passes through this before being embedded in
/// a shell line; a malicious file name must not become a command.
pub(crate) fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Composes `cd <dir> && exec <argv...>` for the remote shell.
pub(crate) fn compose_shell_command(cmd: &RemoteCommand) -> String {
    let argv: Vec<String> = cmd.argv.iter().map(|a| shell_escape(a)).collect();
    let argv = argv.join(" ");
    match &cmd.working_dir {
        Some(dir) => format!("cd {} && exec {}", shell_escape(dir), argv),
        None => format!("exec {argv}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape_quotes() {
        assert_eq!(shell_escape("plain"), "'plain'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape("a$(whoami)b"), "'a$(whoami)b'");
    }

    #[test]
    fn test_compose_with_workdir() {
        let cmd = RemoteCommand::new(["binwalk", "-e", "fw.bin"]).working_dir("/analysis");
        assert_eq!(
            compose_shell_command(&cmd),
            "cd '/analysis' && exec 'binwalk' '-e' 'fw.bin'"
        );
    }

    #[test]
    fn test_compose_without_workdir() {
        let cmd = RemoteCommand::new(["true"]);
        assert_eq!(compose_shell_command(&cmd), "exec 'true'");
    }
}
