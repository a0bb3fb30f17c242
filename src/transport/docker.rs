//! Docker Engine API transport (Docker Desktop backend).
//!
//! Commands run as execs inside the long-lived analysis container via
//! bollard; transfers stream through an attached `cat` exec so uploads and
//! downloads use the same path regardless of where the engine's filesystem
//! actually lives (inside the Docker Desktop utility VM, not on the host).

use crate::command::{CommandResult, OutputChunk, OutputSink, RemoteCommand, TransferRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use std::path::Path;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{compose_shell_command, shell_escape, Transport};

const ENGINE_TIMEOUT_SECS: u64 = 120;

pub struct DockerTransport {
    docker: Docker,
    container: String,
}

impl DockerTransport {
    /// Connects to the engine (platform default socket / named pipe, or an
    /// explicit socket path).
    pub fn connect(socket_path: Option<&str>, container: &str) -> Result<Self> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_socket(path, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(api_err)?;
        Ok(Self {
            docker,
            container: container.to_string(),
        })
    }

    /// Shares an existing engine handle.
    pub fn with_client(docker: Docker, container: &str) -> Self {
        Self {
            docker,
            container: container.to_string(),
        }
    }

    /// Creates a shell exec in the analysis container.
    async fn create_shell_exec(&self, script: String, stdin: bool) -> Result<String> {
        let options = CreateExecOptions::<String> {
            attach_stdin: Some(stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&self.container, options)
            .await
            .map_err(api_err)?;
        Ok(exec.id)
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i32> {
        let inspect = self.docker.inspect_exec(exec_id).await.map_err(api_err)?;
        Ok(inspect.exit_code.unwrap_or(-1) as i32)
    }

    /// Runs a short shell exec, collecting stdout. Returns (exit, stdout).
    async fn run_collect(&self, script: String) -> Result<(i32, Vec<u8>)> {
        let exec_id = self.create_shell_exec(script, false).await?;
        let mut stdout = Vec::new();
        match self
            .docker
            .start_exec(&exec_id, None)
            .await
            .map_err(api_err)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(item) = output.next().await {
                    if let LogOutput::StdOut { message } | LogOutput::Console { message } =
                        item.map_err(api_err)?
                    {
                        stdout.extend_from_slice(&message);
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(Error::Internal("exec started detached".to_string()))
            }
        }
        Ok((self.exec_exit_code(&exec_id).await?, stdout))
    }

    /// Starts `exec_id` and writes its stdout chunk by chunk into `local`.
    /// Returns the exec's exit code; the caller owns partial-file cleanup.
    async fn stream_to_file(
        &self,
        exec_id: &str,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let mut file = tokio::fs::File::create(local).await?;
        match self
            .docker
            .start_exec(exec_id, None)
            .await
            .map_err(api_err)?
        {
            StartExecResults::Attached { mut output, .. } => loop {
                tokio::select! {
                    item = output.next() => match item {
                        None => break,
                        Some(Err(e)) => return Err(api_err(e)),
                        Some(Ok(LogOutput::StdOut { message }))
                        | Some(Ok(LogOutput::Console { message })) => {
                            file.write_all(&message).await.map_err(|e| {
                                Error::TransferFailed {
                                    path: remote.to_string(),
                                    reason: e.to_string(),
                                }
                            })?;
                        }
                        Some(Ok(_)) => {}
                    },
                    // Dropping the attached stream detaches the exec.
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled(remote.to_string()));
                    }
                }
            },
            StartExecResults::Detached => {
                return Err(Error::Internal("exec started detached".to_string()))
            }
        }
        file.flush().await?;
        self.exec_exit_code(exec_id).await
    }
}

#[async_trait]
impl Transport for DockerTransport {
    fn name(&self) -> &str {
        "docker"
    }

    async fn execute(
        &self,
        cmd: &RemoteCommand,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<CommandResult> {
        let script = compose_shell_command(cmd);
        debug!(container = %self.container, %script, "engine exec");

        let exec_id = self.create_shell_exec(script, false).await?;
        let start = Instant::now();

        match self
            .docker
            .start_exec(&exec_id, None)
            .await
            .map_err(api_err)?
        {
            StartExecResults::Attached { mut output, .. } => {
                let mut mirror = true;
                loop {
                    tokio::select! {
                        item = output.next() => match item {
                            None => break,
                            Some(Err(e)) => return Err(api_err(e)),
                            Some(Ok(log)) => {
                                let chunk = match log {
                                    LogOutput::StdOut { message }
                                    | LogOutput::Console { message } => {
                                        OutputChunk::Stdout(message.to_vec())
                                    }
                                    LogOutput::StdErr { message } => {
                                        OutputChunk::Stderr(message.to_vec())
                                    }
                                    LogOutput::StdIn { .. } => continue,
                                };
                                if mirror && sink.send(chunk).await.is_err() {
                                    // Receiver gone; keep draining the exec.
                                    mirror = false;
                                }
                            }
                        },
                        // Dropping the attached stream detaches us; the exec
                        // itself is not killable through the engine API.
                        _ = cancel.cancelled() => {
                            return Err(Error::Cancelled(cmd.describe()));
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(Error::Internal("exec started detached".to_string()))
            }
        }

        Ok(CommandResult {
            exit_code: self.exec_exit_code(&exec_id).await?,
            duration: start.elapsed(),
        })
    }

    async fn upload(&self, req: &TransferRequest, cancel: CancellationToken) -> Result<()> {
        let remote = shell_escape(&req.remote_path);
        let script = format!("mkdir -p \"$(dirname {remote})\" && cat > {remote}");
        let exec_id = self.create_shell_exec(script, true).await?;

        match self
            .docker
            .start_exec(&exec_id, None)
            .await
            .map_err(api_err)?
        {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                let push = async {
                    let mut file = tokio::fs::File::open(&req.local_path).await?;
                    tokio::io::copy(&mut file, &mut input)
                        .await
                        .map_err(|e| Error::TransferFailed {
                            path: req.remote_path.clone(),
                            reason: e.to_string(),
                        })?;
                    input.shutdown().await.ok();
                    drop(input);
                    // Drain until the exec finishes.
                    while let Some(item) = output.next().await {
                        item.map_err(api_err)?;
                    }
                    Ok::<_, Error>(())
                };
                tokio::select! {
                    res = push => res?,
                    // Dropping the attached streams detaches the exec.
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled(req.remote_path.clone()));
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(Error::Internal("exec started detached".to_string()))
            }
        }

        let exit = self.exec_exit_code(&exec_id).await?;
        if exit != 0 {
            return Err(Error::TransferFailed {
                path: req.remote_path.clone(),
                reason: format!("remote write exited with {exit}"),
            });
        }
        Ok(())
    }

    async fn download(&self, req: &TransferRequest, cancel: CancellationToken) -> Result<()> {
        let script = format!("cat {}", shell_escape(&req.remote_path));
        let exec_id = self.create_shell_exec(script, false).await?;

        // Chunks go straight to the destination file; buffering a whole
        // extracted artifact in memory is not acceptable.
        match self
            .stream_to_file(&exec_id, &req.local_path, &req.remote_path, &cancel)
            .await
        {
            Ok(0) => Ok(()),
            Ok(exit) => {
                let _ = tokio::fs::remove_file(&req.local_path).await;
                Err(Error::TransferFailed {
                    path: req.remote_path.clone(),
                    reason: format!("remote read exited with {exit}"),
                })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&req.local_path).await;
                Err(e)
            }
        }
    }

    async fn exists(&self, remote_path: &str) -> Result<bool> {
        let script = format!("test -e {}", shell_escape(remote_path));
        let (exit, _) = self.run_collect(script).await?;
        Ok(exit == 0)
    }

    async fn health_check(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

pub(crate) fn api_err(e: bollard::errors::Error) -> Error {
    Error::EngineApi(e.to_string())
}
