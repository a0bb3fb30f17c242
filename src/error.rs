//! Error types for the provisioning and transport layers.

use crate::provision::ProvisionStep;

/// Result type alias for provisioning and bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning a backend or talking to it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Backend Selection / Provisioning Errors
    // =========================================================================
    /// The host does not satisfy a backend's capability requirements.
    ///
    /// The caller should try the next-ranked backend; retrying the same
    /// backend cannot succeed.
    #[error("host does not support backend '{backend}': {reason}")]
    UnsupportedHost { backend: String, reason: String },

    /// A specific provisioning step failed.
    ///
    /// The environment moves to Degraded carrying the failed step; a retry
    /// resumes at that step. This is never auto-escalated to another backend.
    #[error("provisioning failed at step '{step}': {reason}")]
    ProvisioningFailed { step: ProvisionStep, reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The bridge cannot reach the guest or container.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A command exceeded its allotted time; the remote side has been sent
    /// a best-effort cancellation.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A remote command could not be started or exited abnormally.
    #[error("command failed: {0}")]
    CommandFailed(String),

    // =========================================================================
    // Transfer Errors
    // =========================================================================
    /// Transfer destination exists and overwrite was not requested.
    #[error("destination already exists: {path}")]
    PathConflict { path: String },

    /// Transfer failed (I/O on either end).
    #[error("transfer failed for '{path}': {reason}")]
    TransferFailed { path: String, reason: String },

    // =========================================================================
    // Session / Lifecycle Errors
    // =========================================================================
    /// Operation requested against an environment whose state forbids it.
    #[error("operation '{operation}' not allowed in state '{state}'")]
    StateConflict { state: String, operation: String },

    /// The tracked analysis container does not exist on the backend.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Docker Engine API error (Docker Desktop backend).
    #[error("engine api error: {0}")]
    EngineApi(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (session record, probe output).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if the caller may fall back to the next-ranked backend.
    ///
    /// Only a genuine host-support gap justifies fallback; a failed step on
    /// a capability-satisfying backend is actionable and must be surfaced.
    pub fn allows_backend_fallback(&self) -> bool {
        matches!(self, Error::UnsupportedHost { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
