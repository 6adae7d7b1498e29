//! Instance registry - the persisted list of instance records
//!
//! The registry is a single JSON array rewritten in full on every change.
//! It performs no locking and no atomic replace: one orchestrator per data
//! root is assumed.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::engine::{Engine, InstanceLayout};
use crate::error::{IoContext, OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
}

/// One configured instance of an engine, identified by `<engine>@<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub engine: Engine,
    pub port: u16,
    pub version: String,
    pub data_path: PathBuf,
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub password_set: bool,
}

impl InstanceRecord {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Layout re-derived from what was stored, never from fresh caller input.
    pub fn layout(&self) -> InstanceLayout {
        let layout = InstanceLayout::new(self.engine, self.port, &self.data_path);
        match &self.socket_dir {
            Some(dir) => layout.with_socket_dir(dir),
            None => layout,
        }
    }

    /// `<data-root>/<id>`, the directory removed on delete.
    pub fn instance_dir(&self) -> &Path {
        self.data_path.parent().unwrap_or(&self.data_path)
    }

    /// Append captured output, dropping the oldest text beyond `max_bytes`.
    pub fn append_log(&mut self, text: &str, max_bytes: usize) {
        self.logs.push_str(text);
        if self.logs.len() > max_bytes {
            let mut cut = self.logs.len() - max_bytes;
            while !self.logs.is_char_boundary(cut) {
                cut += 1;
            }
            self.logs.drain(..cut);
        }
    }
}

/// JSON file holding every [`InstanceRecord`].
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    path: PathBuf,
}

impl InstanceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file as an empty list if it does not exist yet.
    pub fn ensure_exists(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&self.path, "[]").io_context(|| format!("creating {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Created empty instance registry");
        Ok(())
    }

    /// All records; an absent file is an empty registry.
    pub fn load(&self) -> Result<Vec<InstanceRecord>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(OrchestratorError::io(
                    format!("reading {}", self.path.display()),
                    e,
                ))
            }
        };
        serde_json::from_str(&raw).map_err(|source| OrchestratorError::Registry {
            path: self.path.clone(),
            source,
        })
    }

    /// Overwrite the file with `records`.
    pub fn save(&self, records: &[InstanceRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(records).map_err(|source| {
            OrchestratorError::Registry {
                path: self.path.clone(),
                source,
            }
        })?;
        fs::write(&self.path, json).io_context(|| format!("writing {}", self.path.display()))
    }
}
