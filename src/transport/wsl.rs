//! In-guest exec transport over `wsl.exe`.
//!
//! Every operation is a `wsl.exe -d <distro> -- sh -c <script>` child
//! process with piped streams. File transfers stream through `cat` on the
//! guest side, so no shared filesystem mount is assumed and the same code
//! works for WSL1 and WSL2 distros.

use crate::command::{CommandResult, OutputSink, RemoteCommand, TransferRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{compose_shell_command, shell_escape, stream_child, Transport};

pub struct WslTransport {
    distro: String,
}

impl WslTransport {
    pub fn new(distro: String) -> Self {
        Self { distro }
    }

    /// A `wsl.exe` invocation running `script` under `sh` in the distro.
    fn guest_command(&self, script: &str) -> Command {
        let mut cmd = Command::new("wsl.exe");
        cmd.arg("-d")
            .arg(&self.distro)
            .arg("--")
            .arg("sh")
            .arg("-c")
            .arg(script);
        cmd
    }

    async fn run_quiet(&self, script: &str) -> Result<i32> {
        let output = self
            .guest_command(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;
        Ok(output.status.code().unwrap_or(-1))
    }

    /// Host file → guest path through the child's stdin.
    async fn push_file(&self, req: &TransferRequest) -> Result<()> {
        let remote = shell_escape(&req.remote_path);
        let script = format!("mkdir -p \"$(dirname {remote})\" && cat > {remote}");

        let mut command = self.guest_command(&script);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("child stdin not piped".to_string()))?;

        let mut file = tokio::fs::File::open(&req.local_path).await?;
        tokio::io::copy(&mut file, &mut stdin)
            .await
            .map_err(|e| Error::TransferFailed {
                path: req.remote_path.clone(),
                reason: e.to_string(),
            })?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::TransferFailed {
                path: req.remote_path.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Guest path → host file through the child's stdout.
    async fn fetch_file(&self, req: &TransferRequest) -> Result<()> {
        let script = format!("cat {}", shell_escape(&req.remote_path));

        let mut command = self.guest_command(&script);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout not piped".to_string()))?;

        let mut file = tokio::fs::File::create(&req.local_path).await?;
        let copied = tokio::io::copy(&mut stdout, &mut file).await;

        let output = child.wait_with_output().await?;
        if copied.is_err() || !output.status.success() {
            // Do not leave a partial destination behind.
            let _ = tokio::fs::remove_file(&req.local_path).await;
            let reason = match copied {
                Err(e) => e.to_string(),
                Ok(_) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            return Err(Error::TransferFailed {
                path: req.remote_path.clone(),
                reason,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for WslTransport {
    fn name(&self) -> &str {
        "wsl"
    }

    async fn execute(
        &self,
        cmd: &RemoteCommand,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<CommandResult> {
        let script = compose_shell_command(cmd);
        debug!(distro = %self.distro, %script, "wsl exec");
        stream_child(self.guest_command(&script), sink, cancel, &cmd.describe()).await
    }

    async fn upload(&self, req: &TransferRequest, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            res = self.push_file(req) => res,
            // Dropping the in-flight future kills the child (kill_on_drop).
            _ = cancel.cancelled() => Err(Error::Cancelled(req.remote_path.clone())),
        }
    }

    async fn download(&self, req: &TransferRequest, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            res = self.fetch_file(req) => res,
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
            code => Err(Error::TransportUnavailable(format!(
                "wsl existence probe exited with {code}"
            ))),
        }
    }

    async fn health_check(&self) -> bool {
        matches!(self.run_quiet("true").await, Ok(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_command_shape() {
        let t = WslTransport::new("kali-linux".to_string());
        let cmd = t.guest_command("echo hi");
        let program = cmd.as_std().get_program().to_string_lossy().to_string();
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(program, "wsl.exe");
        assert_eq!(args, vec!["-d", "kali-linux", "--", "sh", "-c", "echo hi"]);
    }
}
