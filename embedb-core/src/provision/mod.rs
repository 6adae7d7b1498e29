//! Binary provisioning - download, extract, build, verify
//!
//! Provisioned engines live in `<root>/<engine>-<version>/`. A directory with
//! that name only ever appears once its executable is in place: archives are
//! unpacked into a hidden staging directory first, and every failure removes
//! the archive, the staging directory and the target before returning.
//!
//! # Provisioning Pipeline:
//! ```text
//! fetch ──▶ .download-<engine>-<v>.<ext>
//!   tar -xf ──▶ .staging-<engine>-<v>/<extracted>/
//!     rename ──▶ <engine>-<v>/
//!       make (redis only) ──▶ verify executable ──▶ chmod 0755
//! ```

pub mod fetch;

pub use fetch::{ArchiveSource, HttpArchiveSource, MirrorArchiveSource, ProgressTracker};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::engine::{DownloadSpec, Engine};
use crate::error::{IoContext, OrchestratorError, Result};
use crate::launcher::output_tail;

/// Prefix added to `PATH` for the compile step, so `make` finds a toolchain
/// even when the host was started from a GUI session with a minimal PATH.
const BUILD_PATH_PREFIX: &str = "/usr/bin:/bin:/usr/sbin:/sbin:/usr/local/bin:/opt/homebrew/bin";

/// Where an engine's executable was found, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryDescriptor {
    pub engine: Engine,
    pub installed: bool,
    pub path: Option<PathBuf>,
    pub is_system: bool,
    /// Provisioned version; `None` for system installs.
    pub version: Option<String>,
}

impl BinaryDescriptor {
    pub fn missing(engine: Engine) -> Self {
        Self {
            engine,
            installed: false,
            path: None,
            is_system: false,
            version: None,
        }
    }

    /// Executable path if installed.
    pub fn executable(&self) -> Option<&Path> {
        self.path.as_deref().filter(|_| self.installed)
    }
}

/// Resolves and installs engine executables under one provisioning root.
pub struct BinaryProvisioner {
    root: PathBuf,
    system_binaries: bool,
    source: Arc<dyn ArchiveSource>,
}

impl BinaryProvisioner {
    pub fn new(root: impl Into<PathBuf>, system_binaries: bool, source: Arc<dyn ArchiveSource>) -> Self {
        Self {
            root: root.into(),
            system_binaries,
            source,
        }
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).io_context(|| format!("creating {}", self.root.display()))
    }

    /// Canonical directory for a provisioned version.
    pub fn target_dir(&self, engine: Engine, version: &str) -> PathBuf {
        self.root.join(engine.profile().versioned_dir_name(version))
    }

    /// Executable inside `<engine>-<version>`, if that version is installed.
    pub fn locate(&self, engine: Engine, version: &str) -> Option<PathBuf> {
        let exe = self.target_dir(engine, version).join(engine.profile().executable);
        is_executable_file(&exe).then_some(exe)
    }

    /// System install first, then the greatest provisioned version.
    pub fn resolve(&self, engine: Engine) -> BinaryDescriptor {
        let profile = engine.profile();

        if self.system_binaries {
            if let Some(path) = profile
                .system_paths
                .iter()
                .map(PathBuf::from)
                .find(|p| is_executable_file(p))
            {
                debug!(%engine, path = %path.display(), "Using system binary");
                return BinaryDescriptor {
                    engine,
                    installed: true,
                    path: Some(path),
                    is_system: true,
                    version: None,
                };
            }
        }

        let prefix = format!("{engine}-");
        let latest = fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(&prefix))
            .max();

        let Some(dir) = latest else {
            return BinaryDescriptor::missing(engine);
        };

        let exe = self.root.join(&dir).join(profile.executable);
        if !exe.is_file() {
            warn!(%engine, %dir, "Provisioned directory has no executable");
            return BinaryDescriptor::missing(engine);
        }

        BinaryDescriptor {
            engine,
            installed: true,
            path: Some(exe),
            is_system: false,
            version: Some(dir[prefix.len()..].to_string()),
        }
    }

    pub fn resolve_all(&self) -> BTreeMap<Engine, BinaryDescriptor> {
        Engine::ALL.into_iter().map(|e| (e, self.resolve(e))).collect()
    }

    /// Install `engine` at `version`, returning the `<engine>-<version>` directory.
    ///
    /// Returns immediately when that directory already holds the executable.
    pub async fn provision(
        &self,
        engine: Engine,
        version: &str,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<PathBuf> {
        validate_version(engine, version)?;
        let target = self.target_dir(engine, version);
        if self.locate(engine, version).is_some() {
            info!(%engine, version, path = %target.display(), "Binary already provisioned");
            return Ok(target);
        }

        let spec = DownloadSpec::for_host(engine, version)
            .map_err(|reason| OrchestratorError::provisioning(engine, reason))?;
        let archive = self.root.join(spec.archive_name(engine, version));
        let staging = self.root.join(format!(".staging-{engine}-{version}"));

        // Leftovers from an interrupted earlier attempt.
        for path in [&archive, &staging, &target] {
            discard(path);
        }

        match self
            .install(engine, version, &spec, &archive, &staging, &target, on_progress)
            .await
        {
            Ok(()) => {
                discard(&archive);
                discard(&staging);
                info!(%engine, version, path = %target.display(), "Binary installed");
                Ok(target)
            }
            Err(e) => {
                error!(%engine, version, error = %e, "Provisioning failed, removing partial files");
                discard(&archive);
                discard(&staging);
                discard(&target);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn install(
        &self,
        engine: Engine,
        version: &str,
        spec: &DownloadSpec,
        archive: &Path,
        staging: &Path,
        target: &Path,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<()> {
        let profile = engine.profile();
        self.ensure_root()?;

        let bytes = self
            .source
            .fetch(&spec.url, archive, on_progress)
            .await
            .map_err(|e| OrchestratorError::provisioning(engine, format!("{e:#}")))?;
        info!(%engine, version, bytes, "Archive downloaded, extracting");

        fs::create_dir_all(staging).io_context(|| format!("creating {}", staging.display()))?;
        run_tool(
            engine,
            Command::new("tar").arg("-xf").arg(archive).arg("-C").arg(staging),
            "extracting archive",
        )
        .await?;

        let extracted = staging.join(&spec.extracted_dir);
        if !extracted.is_dir() {
            return Err(OrchestratorError::provisioning(
                engine,
                format!("extracted folder not found at {}", extracted.display()),
            ));
        }
        fs::rename(&extracted, target).io_context(|| {
            format!("moving {} to {}", extracted.display(), target.display())
        })?;

        if profile.compile {
            info!(%engine, version, "Compiling from source");
            let path = match std::env::var("PATH") {
                Ok(p) if !p.is_empty() => format!("{BUILD_PATH_PREFIX}:{p}"),
                _ => BUILD_PATH_PREFIX.to_string(),
            };
            let jobs = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            run_tool(
                engine,
                Command::new("make")
                    .arg(format!("-j{jobs}"))
                    .current_dir(target)
                    .env("PATH", path),
                "compilation",
            )
            .await?;
        }

        let exe = target.join(profile.executable);
        if !exe.is_file() {
            return Err(OrchestratorError::provisioning(
                engine,
                format!("binary not found at expected path {}", exe.display()),
            ));
        }
        if let Err(e) = fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)) {
            warn!(path = %exe.display(), error = %e, "Could not mark binary executable");
        }
        Ok(())
    }
}

/// Versions become path components and URL segments, so only plain
/// release names like `7.4.1` or `8.4.0-rc1` are accepted.
pub fn validate_version(engine: Engine, version: &str) -> Result<()> {
    let plain = !version.is_empty()
        && !version.starts_with('.')
        && !version.contains("..")
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if plain {
        return Ok(());
    }
    Err(OrchestratorError::InvalidVersion {
        engine,
        version: version.to_string(),
    })
}

/// Run a build tool to completion, mapping failure to a provisioning error.
async fn run_tool(engine: Engine, cmd: &mut Command, what: &str) -> Result<()> {
    let output = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| OrchestratorError::provisioning(engine, format!("{what} could not start: {e}")))?;

    if output.status.success() {
        return Ok(());
    }
    Err(OrchestratorError::provisioning(
        engine,
        format!(
            "{what} failed ({}): {}",
            output.status,
            output_tail(&output.stderr, 2000)
        ),
    ))
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Best-effort removal of a file or directory tree.
fn discard(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Could not remove partial download");
    }
}
