//! Host capability probing and backend ranking.
//!
//! Inspects the Windows host (WSL kernel state, Docker Desktop, CPU
//! virtualization extensions) and ranks the backends that can host the
//! analysis container. Probing is side-effect-free: every check that errors
//! is recorded as a negative capability, never propagated, because a
//! negative result is itself useful decision input.

use serde::{Deserialize, Serialize};

// =============================================================================
// Host Capability
// =============================================================================

/// Immutable snapshot of what the host can run.
///
/// Recomputed on demand via [`HostCapability::probe`]; never cached across a
/// provisioning attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapability {
    /// CPU virtualization extensions present (VT-x / AMD-V).
    pub virtualization_supported: bool,
    /// WSL2 kernel installed and default version 2 selected.
    pub wsl2_available: bool,
    /// WSL installed at all (a WSL1 fallback is possible).
    pub wsl1_available: bool,
    /// Docker Desktop engine reachable on the host.
    pub docker_desktop_installed: bool,
    /// Firmware-level virtualization toggle, when the host reports it.
    pub bios_virtualization_enabled: Option<bool>,
}

impl HostCapability {
    /// Probes the current host.
    ///
    /// Each check is bounded by [`crate::constants::PROBE_TIMEOUT`] and any
    /// failure degrades to `false`/`None`. On non-Windows hosts this returns
    /// an all-false capability (same stub pattern as the backends).
    pub async fn probe() -> Self {
        #[cfg(target_os = "windows")]
        {
            let wsl = probe_wsl().await;
            Self {
                virtualization_supported: probe_virtualization().await.unwrap_or(false),
                wsl2_available: wsl.default_version_2,
                wsl1_available: wsl.installed,
                docker_desktop_installed: probe_docker_engine().await,
                bios_virtualization_enabled: probe_firmware_toggle().await,
            }
        }

        #[cfg(not(target_os = "windows"))]
        Self::default()
    }

    /// True if `requirement` is satisfied by this snapshot.
    pub fn satisfies(&self, requirement: Requirement) -> bool {
        match requirement {
            Requirement::Virtualization => self.virtualization_supported,
            Requirement::Wsl2 => self.wsl2_available,
            Requirement::Wsl1 => self.wsl1_available,
            Requirement::DockerDesktop => self.docker_desktop_installed,
        }
    }

    /// True if every requirement in `requirements` is satisfied.
    pub fn satisfies_all(&self, requirements: &[Requirement]) -> bool {
        requirements.iter().all(|r| self.satisfies(*r))
    }
}

// =============================================================================
// Backend Descriptors
// =============================================================================

/// Virtualization/container technology capable of hosting the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// WSL2 guest with an in-guest container engine.
    Wsl2,
    /// WSL1 guest (degraded, no full kernel).
    Wsl1,
    /// Docker Desktop on the host, driven over the engine API.
    DockerDesktop,
    /// QEMU VM reached over SSH; the universal last resort.
    Qemu,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wsl2 => write!(f, "wsl2"),
            Self::Wsl1 => write!(f, "wsl1"),
            Self::DockerDesktop => write!(f, "docker-desktop"),
            Self::Qemu => write!(f, "qemu"),
        }
    }
}

impl BackendKind {
    /// Parses from a user-facing name (e.g. "wsl2", "docker-desktop").
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "wsl2" => Some(Self::Wsl2),
            "wsl1" => Some(Self::Wsl1),
            "docker" | "docker-desktop" => Some(Self::DockerDesktop),
            "qemu" => Some(Self::Qemu),
            _ => None,
        }
    }
}

/// Capability atom a backend requires from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requirement {
    /// CPU virtualization extensions only (no hypervisor feature needed).
    Virtualization,
    Wsl2,
    Wsl1,
    DockerDesktop,
}

/// Static description of a backend: its kind, rank, and host requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    /// Lower number = preferred.
    pub priority: u8,
    pub requirements: &'static [Requirement],
}

/// The closed set of known backends.
///
/// Order embeds the design rule WSL2 > WSL1 > DockerDesktop > QEMU: WSL2
/// offers native performance and the deepest integration, and QEMU is the
/// guaranteed-universal last resort requiring only CPU virtualization
/// extensions, not a hypervisor feature already enabled for WSL/Docker.
pub const BACKENDS: [BackendDescriptor; 4] = [
    BackendDescriptor {
        kind: BackendKind::Wsl2,
        priority: 0,
        requirements: &[Requirement::Wsl2],
    },
    BackendDescriptor {
        kind: BackendKind::Wsl1,
        priority: 1,
        requirements: &[Requirement::Wsl1],
    },
    BackendDescriptor {
        kind: BackendKind::DockerDesktop,
        priority: 2,
        requirements: &[Requirement::DockerDesktop],
    },
    BackendDescriptor {
        kind: BackendKind::Qemu,
        priority: 3,
        requirements: &[Requirement::Virtualization],
    },
];

/// Returns the descriptor for `kind`.
pub fn descriptor(kind: BackendKind) -> BackendDescriptor {
    // BACKENDS covers every variant.
    BACKENDS
        .iter()
        .copied()
        .find(|d| d.kind == kind)
        .unwrap_or(BACKENDS[3])
}

/// Filters backends whose requirements are satisfied and sorts them by
/// ascending priority.
///
/// Deterministic for a given snapshot; the caller (the installer front end)
/// iterates the result and moves to the next candidate only on
/// [`crate::Error::UnsupportedHost`].
pub fn rank(caps: &HostCapability) -> Vec<BackendDescriptor> {
    let mut usable: Vec<BackendDescriptor> = BACKENDS
        .iter()
        .copied()
        .filter(|d| caps.satisfies_all(d.requirements))
        .collect();
    usable.sort_by_key(|d| d.priority);
    usable
}

// =============================================================================
// Windows Probes
// =============================================================================

#[cfg(target_os = "windows")]
struct WslProbe {
    installed: bool,
    default_version_2: bool,
}

/// Runs `wsl.exe --status` and inspects the default version.
///
/// `wsl.exe` emits UTF-16 on some builds; decode permissively.
#[cfg(target_os = "windows")]
async fn probe_wsl() -> WslProbe {
    use tracing::debug;

    let output = run_probe("wsl.exe", &["--status"]).await;
    match output {
        Some((true, text)) => {
            let v2 = wsl_default_version_is_2(&text);
            debug!(wsl2 = v2, "wsl --status succeeded");
            WslProbe {
                installed: true,
                default_version_2: v2,
            }
        }
        _ => WslProbe {
            installed: false,
            default_version_2: false,
        },
    }
}

/// Checks whether the Docker engine answers on the host.
#[cfg(target_os = "windows")]
async fn probe_docker_engine() -> bool {
    matches!(
        run_probe("docker.exe", &["version", "--format", "{{.Server.Version}}"]).await,
        Some((true, _))
    )
}

/// Queries CPU virtualization extensions via CIM.
#[cfg(target_os = "windows")]
async fn probe_virtualization() -> Option<bool> {
    let (ok, text) = run_probe(
        "powershell.exe",
        &[
            "-NoProfile",
            "-Command",
            "(Get-CimInstance Win32_Processor).VMMonitorModeExtensions",
        ],
    )
    .await?;
    if !ok {
        return None;
    }
    parse_powershell_bool(&text)
}

/// Queries the firmware-level virtualization toggle via CIM.
#[cfg(target_os = "windows")]
async fn probe_firmware_toggle() -> Option<bool> {
    let (ok, text) = run_probe(
        "powershell.exe",
        &[
            "-NoProfile",
            "-Command",
            "(Get-CimInstance Win32_Processor).VirtualizationFirmwareEnabled",
        ],
    )
    .await?;
    if !ok {
        return None;
    }
    parse_powershell_bool(&text)
}

/// Runs a probe command with [`crate::constants::PROBE_TIMEOUT`].
///
/// Returns `None` when the binary is missing or the probe timed out;
/// otherwise the success flag and decoded stdout.
#[cfg(target_os = "windows")]
async fn run_probe(program: &str, args: &[&str]) -> Option<(bool, String)> {
    use crate::constants::PROBE_TIMEOUT;
    use tokio::process::Command;
    use tracing::debug;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => {
            let text = decode_console_output(&output.stdout);
            Some((output.status.success(), text))
        }
        Ok(Err(e)) => {
            debug!(program, error = %e, "probe command failed to spawn");
            None
        }
        Err(_) => {
            debug!(program, "probe command timed out");
            None
        }
    }
}

/// Decodes console output that may be UTF-8 or UTF-16LE (`wsl.exe`).
pub(crate) fn decode_console_output(bytes: &[u8]) -> String {
    // Interleaved NULs are the UTF-16LE tell.
    if bytes.len() >= 2 && bytes.iter().skip(1).step_by(2).take(8).all(|b| *b == 0) {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).to_string()
    }
}

/// True if `wsl --status` output reports default version 2.
///
/// Only the default-version line (or its localized variant) counts; lines
///// like "Kernel version: 5.15.123.2" must not satisfy this.
#[allow(dead_code)]
fn wsl_default_version_is_2(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim();
        let is_default_line =
            line.to_lowercase().starts_with("default version") || line.starts_with("默认版本");
        is_default_line
            && line
                .rsplit(':')
                .next()
                .map_or(false, |v| v.trim() == "2")
    })
}

/// Parses PowerShell's `True`/`False` stdout.
#[allow(dead_code)]
fn parse_powershell_bool(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
