//! Error type shared by every orchestrator component.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::Engine;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Everything that can go wrong while provisioning or supervising an instance.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Download, extraction, compile or post-install verification failed.
    #[error("provisioning {engine} failed: {reason}")]
    Provisioning { engine: Engine, reason: String },

    /// A version string that cannot name a directory under the provisioning root.
    #[error("invalid {engine} version '{version}'")]
    InvalidVersion { engine: Engine, version: String },

    /// No executable is available for the engine.
    #[error("no {0} binary is installed; create an instance to provision one")]
    BinaryNotInstalled(Engine),

    /// Running as the superuser with no unprivileged account to fall back to.
    #[error("{0}")]
    Privilege(String),

    /// The engine's one-time data directory setup exited unsuccessfully.
    #[error("initializing {engine} failed with exit code {code:?}: {output}")]
    Initialization {
        engine: Engine,
        code: Option<i32>,
        output: String,
    },

    #[error("instance not found: {0}")]
    NotFound(String),

    /// The OS refused to spawn or signal an instance process.
    #[error("process error for {id}: {source}")]
    RuntimeProcess {
        id: String,
        #[source]
        source: io::Error,
    },

    /// A record points outside its own directory under the data root.
    #[error("refusing to remove {path}: it is not the directory of {id}")]
    ForeignPath { id: String, path: PathBuf },

    #[error("instance registry {path} is unreadable: {source}")]
    Registry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn provisioning(engine: Engine, reason: impl Into<String>) -> Self {
        Self::Provisioning {
            engine,
            reason: reason.into(),
        }
    }
}

/// Attach a human-readable context to `io::Result`s, in the spirit of
/// `anyhow::Context` but producing [`OrchestratorError::Io`].
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| OrchestratorError::io(f(), source))
    }
}
