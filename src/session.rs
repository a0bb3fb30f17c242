//! Session state: the single provisioned-environment record.
//!
//! This module defines:
//! - `EnvState`: the environment lifecycle state machine
//! - `ConnectionParams`: how to reach the provisioned guest
//! - `ProvisionedEnvironment`: the one record per process lifetime
//! - `SessionState`: the single-owner context object holding the record
//!
//! The record is persisted as JSON at a fixed well-known path so a
//! relaunched process rediscovers an already-provisioned environment
//! instead of reprovisioning. All mutation goes through one lock.

use crate::capability::BackendKind;
use crate::constants::{SESSION_FILE, SSH_DEFAULT_HOST, SSH_DEFAULT_PORT, SSH_DEFAULT_USER};
use crate::error::{Error, Result};
use crate::provision::ProvisionStep;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Environment State
// =============================================================================

/// Lifecycle state of the provisioned environment.
///
/// ```text
///   Absent ──▶ Provisioning ──▶ Ready ◀──▶ Degraded
///      │             │            │            │
///      └─────────────┴────────────┴────────────┴──▶ Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvState {
    /// No environment exists.
    #[default]
    Absent,
    /// A provisioning flow is in progress.
    Provisioning,
    /// Guest, volume, and container are usable.
    Ready,
    /// A previously-Ready environment failed a health check or a
    /// provisioning step; retained for resume, not torn down.
    Degraded,
    /// Terminal; the record is removed.
    Destroyed,
}

impl EnvState {
    /// True if the transition `self → to` is allowed.
    pub fn can_transition(self, to: EnvState) -> bool {
        use EnvState::*;
        match (self, to) {
            (_, Destroyed) => true,
            (Absent, Provisioning) => true,
            (Provisioning, Ready) | (Provisioning, Degraded) => true,
            (Ready, Degraded) | (Degraded, Ready) => true,
            // Resuming a degraded environment re-enters Provisioning.
            (Degraded, Provisioning) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for EnvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

// =============================================================================
// Connection Parameters
// =============================================================================

/// How the transport reaches the provisioned guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ConnectionParams {
    /// In-guest exec against a registered WSL distro.
    Wsl { distro: String },
    /// SSH session to a QEMU guest on a forwarded loopback port.
    Ssh {
        host: String,
        port: u16,
        user: String,
        /// Identity file for key auth; falls back to the SSH agent.
        #[serde(skip_serializing_if = "Option::is_none")]
        identity_file: Option<PathBuf>,
    },
    /// Local Docker engine socket / named pipe.
    DockerSocket {
        /// Explicit socket path; platform default when `None`.
        #[serde(skip_serializing_if = "Option::is_none")]
        socket_path: Option<String>,
    },
}

impl ConnectionParams {
    /// The conventional SSH parameters for the QEMU guest.
    pub fn default_ssh() -> Self {
        Self::Ssh {
            host: SSH_DEFAULT_HOST.to_string(),
            port: SSH_DEFAULT_PORT,
            user: SSH_DEFAULT_USER.to_string(),
            identity_file: None,
        }
    }
}

// =============================================================================
// Provisioned Environment
// =============================================================================

/// The process-wide record of the active backend.
///
/// Owned exclusively by [`SessionState`]; mutated only by the provisioner
/// and the container manager. One instance per process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedEnvironment {
    pub backend: BackendKind,
    pub connection: ConnectionParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    /// Only meaningful while `state` is Ready or Degraded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub state: EnvState,
    /// Step to resume from after a provisioning failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<ProvisionStep>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisionedEnvironment {
    fn new(backend: BackendKind, connection: ConnectionParams) -> Self {
        Self {
            backend,
            connection,
            volume_id: None,
            container_id: None,
            state: EnvState::Provisioning,
            failed_step: None,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Single-owner context object for the environment record.
///
/// Constructed at startup (loading any persisted record), torn down on
/// shutdown or explicit [`SessionState::destroy`]. The inner mutex is the
/// one state lock from the concurrency model: provisioning, restarts, and
/// health flips all serialize through it.
pub struct SessionState {
    store_path: PathBuf,
    inner: Mutex<Option<ProvisionedEnvironment>>,
}

impl SessionState {
    /// Loads the session from the default platform data directory.
    pub fn load() -> Result<Self> {
        Self::with_store_path(Self::default_store_path())
    }

    /// Loads the session from an explicit record path.
    pub fn with_store_path(store_path: PathBuf) -> Result<Self> {
        let record = if store_path.exists() {
            match std::fs::read_to_string(&store_path) {
                Ok(text) => match serde_json::from_str::<ProvisionedEnvironment>(&text) {
                    Ok(env) => {
                        info!(backend = %env.backend, state = %env.state, "restored session record");
                        Some(env)
                    }
                    Err(e) => {
                        warn!(error = %e, "session record unreadable, starting fresh");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "session record unreadable, starting fresh");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            store_path,
            inner: Mutex::new(record),
        })
    }

    /// Default record path: `<data_local>/fwbridge/session.json`.
    fn default_store_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("fwbridge")
            .join(SESSION_FILE)
    }

    /// Returns a copy of the current record, if any.
    pub fn snapshot(&self) -> Option<ProvisionedEnvironment> {
        self.inner.lock().ok().and_then(|g| g.clone())
    }

    /// Current state (Absent when no record exists).
    pub fn state(&self) -> EnvState {
        self.snapshot().map(|e| e.state).unwrap_or(EnvState::Absent)
    }

    /// Begins (or resumes) provisioning for `backend`.
    ///
    /// Returns the step to resume from when the existing record is a
    /// Degraded environment of the same backend. Fails with `StateConflict`
    /// when another environment is active: the caller must destroy first.
    pub fn begin_provisioning(
        &self,
        backend: BackendKind,
        connection: ConnectionParams,
    ) -> Result<Option<ProvisionStep>> {
        let mut guard = self.lock()?;
        match guard.as_ref() {
            None => {}
            Some(env) if env.state == EnvState::Destroyed => {}
            Some(env) if env.state == EnvState::Degraded && env.backend == backend => {
                let resume = env.failed_step;
                let mut env = env.clone();
                env.state = EnvState::Provisioning;
                env.updated_at = Utc::now();
                self.persist(&env)?;
                *guard = Some(env);
                debug!(backend = %backend, resume = ?resume, "resuming degraded environment");
                return Ok(resume);
            }
            Some(env) => {
                return Err(Error::StateConflict {
                    state: env.state.to_string(),
                    operation: format!("provision {backend}"),
                });
            }
        }

        let env = ProvisionedEnvironment::new(backend, connection);
        self.persist(&env)?;
        *guard = Some(env);
        Ok(None)
    }

    /// Marks the environment Ready with its workspace identifiers.
    pub fn mark_ready(&self, volume_id: String, container_id: String) -> Result<()> {
        self.mutate("mark ready", |env| {
            env.volume_id = Some(volume_id.clone());
            env.container_id = Some(container_id.clone());
            env.failed_step = None;
            env.state = EnvState::Ready;
        })
    }

    /// Marks the environment Degraded, recording the failed step when the
    /// degradation came from provisioning (health flips pass `None` and the
    /// previous resume point is kept).
    pub fn mark_degraded(&self, failed_step: Option<ProvisionStep>) -> Result<()> {
        self.mutate("mark degraded", |env| {
            if failed_step.is_some() {
                env.failed_step = failed_step;
            }
            env.state = EnvState::Degraded;
        })
    }

    /// Applies a health verdict, flipping Ready↔Degraded.
    ///
    /// Transitions in other states are ignored; a health probe racing a
    /// provisioning flow must not corrupt the state machine.
    pub fn apply_health(&self, healthy: bool) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(env) = guard.as_mut() {
            let target = if healthy {
                EnvState::Ready
            } else {
                EnvState::Degraded
            };
            if env.state != target && env.state.can_transition(target) {
                debug!(from = %env.state, to = %target, "health flip");
                env.state = target;
                env.updated_at = Utc::now();
                self.persist(env)?;
            }
        }
        Ok(())
    }

    /// Records the tracked container id.
    pub fn set_container(&self, container_id: Option<String>) -> Result<()> {
        self.mutate("set container", |env| env.container_id = container_id.clone())
    }

    /// Destroys the environment: terminal state, persisted record removed.
    pub fn destroy(&self) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(env) = guard.as_mut() {
            env.state = EnvState::Destroyed;
            env.container_id = None;
            env.updated_at = Utc::now();
        }
        if self.store_path.exists() {
            std::fs::remove_file(&self.store_path)?;
        }
        info!("session destroyed");
        Ok(())
    }

    fn mutate(
        &self,
        operation: &str,
        f: impl FnOnce(&mut ProvisionedEnvironment),
    ) -> Result<()> {
        let mut guard = self.lock()?;
        let env = guard.as_mut().ok_or_else(|| Error::StateConflict {
            state: EnvState::Absent.to_string(),
            operation: operation.to_string(),
        })?;
        if env.state == EnvState::Destroyed {
            return Err(Error::StateConflict {
                state: env.state.to_string(),
                operation: operation.to_string(),
            });
        }
        f(env);
        env.updated_at = Utc::now();
        self.persist(env)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<ProvisionedEnvironment>>> {
        self.inner
            .lock()
            .map_err(|e| Error::Internal(format!("session lock poisoned: {e}")))
    }

    /// Writes the record atomically: temp file in the same directory, then
    /// rename over the final path.
    fn persist(&self, env: &ProvisionedEnvironment) -> Result<()> {
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(env)?;
        let temp_path = self.store_path.with_extension("json.tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, &self.store_path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            Error::Io(e)
        })?;
        Ok(())
    }

    /// Path of the persisted record.
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }
}
