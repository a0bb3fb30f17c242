//! # fwbridge
//!
//! **Firmware-Analysis Environment Provisioner and Remote Bridge**
//!
//! This crate provisions an isolated Linux execution environment on a
//! Windows host and exposes it as a uniform remote command/file surface,
//! so a front end can drive a containerized firmware-analysis tool
//! (binwalk) without any native Linux tooling on the host.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            fwbridge                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                    Capability Probe                         │    │
//! │  │   wsl --status │ docker version │ CIM virtualization flags  │    │
//! │  │            rank: WSL2 > WSL1 > DockerDesktop > QEMU         │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │                                   │
//! │  ┌──────────────────────────────┼──────────────────────────────┐    │
//! │  │                       Provisioner                           │    │
//! │  │  GuestCheck → InstallGuest → ConfigureGuest → PullImage →   │    │
//! │  │  CreateWorkspace        (resumable, convergent, idempotent) │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │                                   │
//! │  ┌──────────────────────────────┼──────────────────────────────┐    │
//! │  │                     Transport Bridge                        │    │
//! │  │  streamed exec │ file transfer │ health │ timeout │ cancel  │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! ├─────────────────────────────────┼───────────────────────────────────┤
//! │                            Transports                               │
//! │  ┌──────────────┐   ┌───────────────┐   ┌───────────────────┐       │
//! │  │ WslTransport │   │ SshTransport  │   │  DockerTransport  │       │
//! │  │ wsl.exe exec │   │ OpenSSH + scp │   │ engine API execs  │       │
//! │  └──────────────┘   └───────────────┘   └───────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Environment Lifecycle
//!
//! ```text
//!   ┌────────┐  provision  ┌──────────────┐  steps ok  ┌───────┐
//!   │ Absent │ ──────────► │ Provisioning │ ─────────► │ Ready │
//!   └────────┘             └──────┬───────┘            └───┬───┘
//!                                 │ step failed     health │ ▲
//!                                 ▼                 failed ▼ │ recovered
//!                          ┌──────────┐  resume   ┌──────────┐
//!                          │ Degraded │ ◄───────► │ Degraded │
//!                          └──────────┘           └──────────┘
//!                        (any state) ──destroy──► Destroyed
//! ```
//!
//! One environment per process lifetime, persisted as JSON so a relaunch
//! rediscovers it instead of reprovisioning. Provisioning failures are
//! retained with their failed step and resumed, never silently escalated
//! to a lower-ranked backend.
//!
//! # Example
//!
//! ```rust,ignore
//! use fwbridge::{ContainerManager, HostCapability, Provisioner, RemoteCommand, SessionState};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fwbridge::Result<()> {
//!     let session = Arc::new(SessionState::load()?);
//!     let caps = HostCapability::probe().await;
//!     let env = Provisioner::new(session.clone()).provision_auto(&caps).await?;
//!
//!     let manager = ContainerManager::from_environment(session, &env)?;
//!     let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//!     let cancel = tokio_util::sync::CancellationToken::new();
//!     let run = manager.execute(
//!         &RemoteCommand::new(["binwalk", "-e", "/analysis/firmware.bin"]),
//!         tx,
//!         &cancel,
//!     );
//!     // ... drain rx while run is in flight
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod command;
pub mod constants;
pub mod error;
pub mod manager;
pub mod provision;
pub mod session;
pub mod transport;

// Re-exports
pub use capability::{rank, BackendDescriptor, BackendKind, HostCapability, Requirement, BACKENDS};
pub use command::{
    CommandResult, OutputChunk, OutputSink, RemoteCommand, TransferDirection, TransferRequest,
};
pub use constants::*;
pub use error::{Error, Result};
pub use manager::{ContainerManager, ContainerOps, ContainerStatus, EngineOps, GuestCliOps};
pub use provision::{
    driver_for, BackendDriver, DockerDesktopDriver, ProvisionStep, Provisioner, QemuDriver,
    WslDriver,
};
pub use session::{ConnectionParams, EnvState, ProvisionedEnvironment, SessionState};
pub use transport::{DockerTransport, SshTransport, Transport, TransportBridge, WslTransport};
