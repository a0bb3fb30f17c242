//! Command and transfer value objects shared by every transport.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Remote Command
// =============================================================================

/// A command to run against the guest or container.
///
/// Value object, consumed once per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Program and arguments, in order.
    pub argv: Vec<String>,
    /// Working directory on the remote side (transport default if `None`).
    pub working_dir: Option<String>,
    /// Wall-clock bound; `None` means no bound.
    pub timeout: Option<Duration>,
}

impl RemoteCommand {
    /// Creates a command from an argv sequence.
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            working_dir: None,
            timeout: None,
        }
    }

    /// Sets the remote working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the wall-clock bound.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Short human-readable description for logs and timeout errors.
    pub fn describe(&self) -> String {
        self.argv.first().cloned().unwrap_or_else(|| "<empty>".to_string())
    }
}

// =============================================================================
// Streamed Output
// =============================================================================

/// One chunk of remote output, delivered as it is produced.
///
/// Chunks of the same stream are internally ordered; relative interleaving
/// between stdout and stderr is best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

impl OutputChunk {
    /// The raw bytes of this chunk.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Stdout(b) | Self::Stderr(b) => b,
        }
    }
}

/// Caller-supplied sink that output chunks are mirrored into.
///
/// The transport stops mirroring (but keeps running the command) if the
/// receiver is dropped; output is a single non-restartable pass.
pub type OutputSink = tokio::sync::mpsc::Sender<OutputChunk>;

/// Terminal result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Remote exit code; -1 when the remote process died without one.
    pub exit_code: i32,
    /// Wall-clock duration of the invocation.
    pub duration: Duration,
}

impl CommandResult {
    /// True if the command exited zero.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// File Transfer
// =============================================================================

/// Direction of a whole-file transfer relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// A whole-file transfer between the host and the guest-side volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    /// Path on the Windows host.
    pub local_path: PathBuf,
    /// Path inside the guest/container (POSIX).
    pub remote_path: String,
    /// Replace the destination if it already exists.
    pub overwrite: bool,
}

impl TransferRequest {
    /// Host file → guest path.
    pub fn upload(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Upload,
            local_path: local.into(),
            remote_path: remote.into(),
            overwrite: false,
        }
    }

    /// Guest path → host file.
    pub fn download(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self {
            direction: TransferDirection::Download,
            local_path: local.into(),
            remote_path: remote.into(),
            overwrite: false,
        }
    }

    /// Permits replacing an existing destination.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = RemoteCommand::new(["binwalk", "-e", "/analysis/fw.bin"])
            .working_dir("/analysis")
            .timeout(Duration::from_secs(60));
        assert_eq!(cmd.argv.len(), 3);
        assert_eq!(cmd.working_dir.as_deref(), Some("/analysis"));
        assert_eq!(cmd.describe(), "binwalk");
    }

    #[test]
    fn test_transfer_builders() {
        let up = TransferRequest::upload("C:\\fw.bin", "/analysis/fw.bin");
        assert_eq!(up.direction, TransferDirection::Upload);
        assert!(!up.overwrite);

        let down = TransferRequest::download("/analysis/out.log", "out.log").overwrite(true);
        assert_eq!(down.direction, TransferDirection::Download);
        assert!(down.overwrite);
    }

    #[test]
    fn test_result_success() {
        let ok = CommandResult {
            exit_code: 0,
            duration: Duration::from_millis(5),
        };
        assert!(ok.is_success());
        let bad = CommandResult {
            exit_code: 3,
            duration: Duration::ZERO,
        };
        assert!(!bad.is_success());
    }
}
