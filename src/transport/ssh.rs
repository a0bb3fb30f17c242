//! SSH transport to the QEMU guest.
//!
//! Shells out to the OpenSSH client (`ssh` / `scp`), which ships with
//! Windows 10+. One `ssh` process per command keeps the transport
//! stateless; key auth only (`BatchMode=yes`), so a misconfigured guest
//! fails fast instead of hanging on a password prompt.

use crate::command::{CommandResult, OutputSink, RemoteCommand, TransferRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{compose_shell_command, shell_escape, stream_child, Transport};

/// OpenSSH exit code for "connection or client failure" (as opposed to a
/// remote command's own exit code).
const SSH_CLIENT_FAILURE: i32 = 255;

pub struct SshTransport {
    host: String,
    port: u16,
    user: String,
    identity_file: Option<PathBuf>,
}

impl SshTransport {
    pub fn new(host: String, port: u16, user: String, identity_file: Option<PathBuf>) -> Self {
        Self {
            host,
            port,
            user,
            identity_file,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by `ssh` and `scp` invocations.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn ssh_command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args())
            .arg("-p")
            .arg(self.port.to_string())
            .arg(self.destination())
            .arg(remote);
        cmd
    }

    /// Runs a short remote command, discarding output. Returns the remote
    /// exit code.
    async fn run_quiet(&self, remote: &str) -> Result<i32> {
        let output = self
            .ssh_command(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;
        Ok(output.status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn execute(
        &self,
        cmd: &RemoteCommand,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<CommandResult> {
        let remote = compose_shell_command(cmd);
        debug!(host = %self.host, port = self.port, %remote, "ssh exec");
        let mut command = self.ssh_command(&remote);
        command.env("LC_ALL", "C");
        stream_child(command, sink, cancel, &cmd.describe()).await
    }

    async fn upload(&self, req: &TransferRequest, cancel: CancellationToken) -> Result<()> {
        let mut command = Command::new("scp");
        command
            .args(self.base_args())
            .arg("-P")
            .arg(self.port.to_string())
            .arg(&req.local_path)
            .arg(format!(
                "{}:{}",
                self.destination(),
                shell_escape(&req.remote_path)
            ));
        tokio::select! {
            res = run_scp(command, &req.remote_path) => res,
            // Dropping the in-flight future kills scp (kill_on_drop).
            _ = cancel.cancelled() => Err(Error::Cancelled(req.remote_path.clone())),
        }
    }

    async fn download(&self, req: &TransferRequest, cancel: CancellationToken) -> Result<()> {
        let mut command = Command::new("scp");
        command
            .args(self.base_args())
            .arg("-P")
            .arg(self.port.to_string())
            .arg(format!(
                "{}:{}",
                self.destination(),
                shell_escape(&req.remote_path)
            ))
            .arg(&req.local_path);
        tokio::select! {
            res = run_scp(command, &req.remote_path) => res,
            _ = cancel.cancelled() => {
                let _ = tokio::fs::remove_file(&req.local_path).await;
                Err(Error::Cancelled(req.remote_path.clone()))
            }
        }
    }

    async fn exists(&self, remote_path: &str) -> Result<bool> {
        let probe = format!("test -e {}", shell_escape(remote_path));
        match self.run_quiet(&probe).await? {
            0 => Ok(true),
            1 => Ok(false),
            SSH_CLIENT_FAILURE => Err(Error::TransportUnavailable(format!(
                "ssh connection to {} failed",
                self.destination()
            ))),
            code => Err(Error::CommandFailed(format!(
                "existence probe exited with {code}"
            ))),
        }
    }

    async fn health_check(&self) -> bool {
        matches!(self.run_quiet("true").await, Ok(0))
    }
}

async fn run_scp(mut command: Command, remote_path: &str) -> Result<()> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::TransferFailed {
            path: remote_path.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
