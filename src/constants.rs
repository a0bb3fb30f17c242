//! # Environment Constants
//!
//! Defines the well-known names, connection defaults, and timeouts used
//! across the provisioning and transport layers. These constants are the
//! **single source of truth** for the fixed conventions of the analysis
//! environment.
//!
//! ## Fixed Conventions
//!
//! The analysis container, its volume, and the guest distro all use fixed
//! names so that every provisioning step can be a convergent "does X already
//! exist" check instead of an unconditional create. Callers may override the
//! connection defaults per configuration; the names are not configurable.
//!
//! ## Cross-References
//!
//! - [`crate::provision`]: Uses the guest/image names during provisioning
//! - [`crate::transport`]: Uses connection defaults and timeouts
//! - [`crate::manager`]: Uses the container/volume names for lifecycle ops

use std::time::Duration;

// =============================================================================
// Well-Known Names
// =============================================================================

/// OCI image reference of the containerized analysis tool.
pub const ANALYSIS_IMAGE: &str = "refirmlabs/binwalk:latest";

/// Fixed name of the single long-lived analysis container.
///
/// Container creation is the most expensive step in the pipeline, so one
/// container is created per session and reused across analysis runs.
pub const CONTAINER_NAME: &str = "binwalkv3";

/// Fixed name of the persistent volume backing the analysis directory.
pub const VOLUME_NAME: &str = "binwalkv3";

/// Mount point of the analysis volume inside the container.
pub const ANALYSIS_DIR: &str = "/analysis";

/// Name of the minimal Linux distro registered for the WSL backends.
pub const GUEST_DISTRO: &str = "kali-linux";

/// File name of the persisted session record (under the app data directory).
pub const SESSION_FILE: &str = "session.json";

// =============================================================================
// SSH Defaults (QEMU backend)
// =============================================================================
//
// The QEMU guest follows a fixed convention: a known user and a forwarded
// SSH port on loopback. Callers may override all of these per configuration;
// they are conveniences, not requirements of the bridge.
// =============================================================================

/// Loopback address the QEMU user-mode network forwards from.
pub const SSH_DEFAULT_HOST: &str = "127.0.0.1";

/// Host port forwarded to guest port 22.
pub const SSH_DEFAULT_PORT: u16 = 2222;

/// Default guest user.
pub const SSH_DEFAULT_USER: &str = "kali";

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for each individual capability probe command.
///
/// Probes must never hang the selection flow; a probe that exceeds this
/// bound is recorded as a negative capability, not an error.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for short `wsl.exe` management commands (list, status).
pub const WSL_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for registering a guest distro or starting Docker Desktop.
pub const GUEST_INSTALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Timeout for installing and starting the container engine inside a guest.
pub const GUEST_CONFIGURE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Timeout for pulling the analysis image.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Timeout for the QEMU guest to boot far enough to answer SSH.
pub const GUEST_BOOT_TIMEOUT: Duration = Duration::from_secs(180);

/// Poll interval while waiting for a guest to come up.
pub const GUEST_BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Timeout for container lifecycle commands (create, start, stop, remove).
pub const CONTAINER_OP_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for the lightweight liveness probe.
///
/// Health checks run on their own channel and must return quickly enough
/// to drive the Ready/Degraded flip without blocking callers.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// I/O Bounds
// =============================================================================

/// Read size for streamed command output chunks (8 KiB).
pub const OUTPUT_CHUNK_SIZE: usize = 8 * 1024;

/// Capacity of the output channel between a transport and its consumer.
///
/// Bounds memory when the consumer is slower than the producer; the
/// producer backpressures instead of buffering the whole output.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Maximum captured output for internal control commands (1 MiB).
///
/// Control commands (status checks, volume creation) have small outputs;
/// anything larger indicates a misdirected command and is truncated.
pub const MAX_CONTROL_OUTPUT: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_stable() {
        // The container and volume share the fixed well-known name.
        assert_eq!(CONTAINER_NAME, VOLUME_NAME);
        assert!(ANALYSIS_DIR.starts_with('/'));
    }

    #[test]
    fn test_health_probe_is_short() {
        assert!(HEALTH_CHECK_TIMEOUT < CONTAINER_OP_TIMEOUT);
        assert!(PROBE_TIMEOUT < GUEST_INSTALL_TIMEOUT);
    }
}
