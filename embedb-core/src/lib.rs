//! embedb Core - Embedded Database Instance Orchestrator
//!
//! Provisions and runs local copies of database engines for development:
//! downloads engine binaries, initializes data directories, starts the
//! servers under a non-root identity, tracks them in a persisted registry
//! and tears them down cleanly.
//!
//! # Components:
//! - [`InstanceRegistry`]: JSON list of instance records
//! - [`PrivilegeResolver`]: which account runs database processes
//! - [`BinaryProvisioner`]: resolve, download, extract and build engine binaries
//! - [`ProcessSupervisor`]: live process handles, exit events, two-phase termination
//! - [`Orchestrator`]: the lifecycle state machine tying the above together

pub mod config;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod orchestrator;
pub mod privilege;
pub mod provision;
pub mod registry;
pub mod supervisor;

pub use config::{OrchestratorConfig, DEFAULT_GRACE_PERIOD};
pub use engine::{ConnectionInfo, Engine, EngineProfile, InstanceLayout};
pub use error::{OrchestratorError, Result};
pub use launcher::{LaunchSpec, Launcher, SystemLauncher};
pub use orchestrator::{CleanupReport, Orchestrator};
pub use privilege::{Account, PrivilegeResolver};
pub use provision::{
    ArchiveSource, BinaryDescriptor, BinaryProvisioner, HttpArchiveSource, MirrorArchiveSource,
};
pub use registry::{InstanceRecord, InstanceRegistry, InstanceStatus};
pub use supervisor::{OutputStream, ProcessSupervisor, SupervisorEvent};

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
///
/// Calling it again once a subscriber is installed is harmless.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        return Ok(());
    }

    info!("Initializing embedb v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
