//! Orchestrator - the instance lifecycle state machine
//!
//! The [`Orchestrator`] is the command surface a host application calls. It
//! owns the binary cache and the process supervisor, and is the only writer
//! of the instance registry.
//!
//! # Lifecycle:
//! ```text
//! Absent ──create──▶ Initializing ──spawn──▶ Running ◀──start── Stopped
//!   ▲                     │ (failure)           │ stop / exit      │
//!   │                     ▼                     ▼                  │
//!   └──────────── nothing recorded          Stopped ──delete──▶ Absent
//! ```
//!
//! # Event Flow:
//! Supervising tasks never touch the registry. They queue
//! [`SupervisorEvent`]s, and every command starts by applying whatever is
//! pending through [`Orchestrator::process_events`]. Hosts that sit idle
//! between commands can await [`Orchestrator::next_event`] instead.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::engine::args::{instance_dir, instance_id, pg_hba, redis_config, HbaMethod, LOOPBACK};
use crate::engine::{ConnectionInfo, Engine, InitStep, InstanceLayout};
use crate::error::{IoContext, OrchestratorError, Result};
use crate::launcher::{self, output_tail, LaunchSpec, Launcher, SystemLauncher};
use crate::privilege::PrivilegeResolver;
use crate::provision::{
    validate_version, ArchiveSource, BinaryDescriptor, BinaryProvisioner, HttpArchiveSource,
    MirrorArchiveSource,
};
use crate::registry::{InstanceRecord, InstanceRegistry, InstanceStatus};
use crate::supervisor::{ProcessSupervisor, SupervisorEvent};

/// Characters of init tool output kept in an [`OrchestratorError::Initialization`].
const INIT_OUTPUT_TAIL: usize = 4000;

/// Outcome of stopping every running instance.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub stopped: Vec<String>,
    /// Instance id and the reason it could not be stopped.
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: InstanceRegistry,
    privilege: PrivilegeResolver,
    provisioner: BinaryProvisioner,
    supervisor: ProcessSupervisor,
    events: mpsc::UnboundedReceiver<SupervisorEvent>,
    /// Events already applied to the registry, not yet handed out by `next_event`.
    applied: VecDeque<SupervisorEvent>,
    binaries: BTreeMap<Engine, BinaryDescriptor>,
}

impl Orchestrator {
    /// Orchestrator for the real system: detected identity, OS launcher and
    /// HTTPS downloads (or the configured archive mirror).
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let privilege = PrivilegeResolver::detect()?;
        let source: Arc<dyn ArchiveSource> = match &config.archive_mirror {
            Some(dir) => {
                info!(mirror = %dir.display(), "Using local archive mirror");
                Arc::new(MirrorArchiveSource::new(dir))
            }
            None => Arc::new(
                HttpArchiveSource::new().map_err(|e| OrchestratorError::Config(format!("{e:#}")))?,
            ),
        };
        Self::with_parts(config, privilege, Arc::new(SystemLauncher), source)
    }

    /// Orchestrator assembled from explicit parts.
    ///
    /// Creates the data root, the registry file and the provisioning root,
    /// resolves binaries, and reconciles records left running by a previous
    /// session.
    pub fn with_parts(
        config: OrchestratorConfig,
        privilege: PrivilegeResolver,
        launcher: Arc<dyn Launcher>,
        source: Arc<dyn ArchiveSource>,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_root)
            .io_context(|| format!("creating {}", config.data_root.display()))?;

        let registry = InstanceRegistry::new(config.registry_path());
        registry.ensure_exists()?;

        let provisioner =
            BinaryProvisioner::new(config.binaries_dir(), config.system_binaries, source);
        provisioner.ensure_root()?;
        let binaries = provisioner.resolve_all();
        for desc in binaries.values() {
            debug!(engine = %desc.engine, installed = desc.installed, path = ?desc.path, "Resolved binary");
        }

        let (supervisor, events) = ProcessSupervisor::new(launcher);
        let mut orchestrator = Self {
            config,
            registry,
            privilege,
            provisioner,
            supervisor,
            events,
            applied: VecDeque::new(),
            binaries,
        };
        orchestrator.reconcile()?;

        info!(
            data_root = %orchestrator.config.data_root.display(),
            user = %orchestrator.privilege.target().name,
            "Orchestrator ready"
        );
        Ok(orchestrator)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn privilege(&self) -> &PrivilegeResolver {
        &self.privilege
    }

    /// Records still marked running whose process is gone, or whose pid now
    /// belongs to some other program, become stopped.
    fn reconcile(&self) -> Result<usize> {
        let mut records = self.registry.load()?;
        let mut changed = 0;
        for rec in records.iter_mut().filter(|r| r.is_running()) {
            match rec.pid {
                Some(pid) if self.owns_process(rec, pid) => {
                    warn!(id = %rec.id, pid, "Instance from a previous session is still running, leaving it alone");
                }
                _ => {
                    info!(id = %rec.id, "Instance process is gone, marking stopped");
                    rec.status = InstanceStatus::Stopped;
                    rec.pid = None;
                    rec.append_log("\n[Marked stopped: process not found at startup]\n", self.config.max_log_bytes);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.registry.save(&records)?;
        }
        Ok(changed)
    }

    /// Installed executable for a stored record: its own version first,
    /// then whatever binary is cached for the engine.
    fn record_executable(&self, rec: &InstanceRecord) -> Option<PathBuf> {
        self.provisioner.locate(rec.engine, &rec.version).or_else(|| {
            self.binaries
                .get(&rec.engine)
                .and_then(|d| d.executable())
                .filter(|p| p.is_file())
                .map(Path::to_path_buf)
        })
    }

    /// Whether `pid` is still this record's server rather than a reused pid.
    fn owns_process(&self, rec: &InstanceRecord, pid: u32) -> bool {
        launcher::process_matches(pid, self.record_executable(rec).as_deref(), &rec.data_path)
    }

    /// Cached descriptors for every engine.
    pub fn list_binaries(&self) -> &BTreeMap<Engine, BinaryDescriptor> {
        &self.binaries
    }

    /// Re-scan system paths and the provisioning root.
    pub fn refresh_binaries(&mut self) -> &BTreeMap<Engine, BinaryDescriptor> {
        self.binaries = self.provisioner.resolve_all();
        &self.binaries
    }

    pub fn list_instances(&mut self) -> Result<Vec<InstanceRecord>> {
        self.process_events()?;
        self.registry.load()
    }

    /// Provision, initialize and start a new instance of `engine`.
    ///
    /// `port` is a hint: a busy port is replaced by a free one. If a record
    /// for `engine` on `port` already exists it is returned instead, started
    /// if it was stopped. `version` of `None` or `"latest"` uses whatever
    /// binary is already available, provisioning the default version if
    /// there is none.
    pub async fn create_instance(
        &mut self,
        engine: Engine,
        port: Option<u16>,
        version: Option<&str>,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<InstanceRecord> {
        self.process_events()?;
        let version = version.filter(|v| !v.is_empty() && *v != "latest");
        if let Some(version) = version {
            validate_version(engine, version)?;
        }
        let port = port.filter(|p| *p != 0);

        let mut records = self.registry.load()?;
        if let Some(port) = port {
            let id = instance_id(engine, port);
            if records.iter().any(|r| r.id == id) {
                info!(id = %id, "Instance already exists, reusing it");
                return self.start_instance(&id);
            }
        }

        let port = pick_port(port)?;
        let id = instance_id(engine, port);
        if records.iter().any(|r| r.id == id) {
            return self.start_instance(&id);
        }

        let dir = instance_dir(&self.config.data_root, engine, port);
        let fresh = !dir.exists();
        let layout = InstanceLayout::new(engine, port, dir.join("data"));

        info!(id = %id, version = version.unwrap_or("latest"), "Creating instance");
        let (pid, version) = match self.materialize(&id, &layout, version, on_progress).await {
            Ok(started) => started,
            Err(e) => {
                warn!(id = %id, error = %e, "Instance creation failed");
                if fresh {
                    if let Err(rm) = fs::remove_dir_all(&dir) {
                        debug!(path = %dir.display(), error = %rm, "Could not remove partial instance directory");
                    }
                }
                return Err(e);
            }
        };

        let profile = engine.profile();
        let record = InstanceRecord {
            id: id.clone(),
            engine,
            port,
            version,
            data_path: layout.data_path.clone(),
            socket_dir: profile.persists_socket_dir.then(|| layout.socket_dir.clone()),
            username: profile.default_username.map(String::from),
            status: InstanceStatus::Running,
            pid: Some(pid),
            logs: String::new(),
            password_set: false,
        };
        records.push(record.clone());

        if let Err(e) = self.registry.save(&records) {
            warn!(id = %id, error = %e, "Could not record instance, stopping it");
            if let Err(stop) = self.supervisor.stop(&id, self.config.grace_period()) {
                warn!(id = %id, error = %stop, "Could not stop unrecorded instance");
            }
            return Err(e);
        }

        info!(id = %id, pid, "Instance created");
        Ok(record)
    }

    /// Everything between "no instance" and "process running".
    async fn materialize(
        &mut self,
        id: &str,
        layout: &InstanceLayout,
        version: Option<&str>,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<(u32, String)> {
        fs::create_dir_all(&layout.data_path)
            .io_context(|| format!("creating {}", layout.data_path.display()))?;
        if let Some(dir) = layout.data_path.parent() {
            self.privilege.fix_ownership(dir);
        }

        let (exe, version) = self.binary_for(layout.engine, version, on_progress).await?;
        self.initialize(layout, &exe).await?;
        let pid = self.spawn_server(id, layout, &exe)?;
        Ok((pid, version))
    }

    /// Executable to run and the version to record for it.
    async fn binary_for(
        &mut self,
        engine: Engine,
        version: Option<&str>,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<(PathBuf, String)> {
        let profile = engine.profile();

        if version.is_none() {
            if let Some(desc) = self.binaries.get(&engine) {
                if let Some(exe) = desc.executable().filter(|p| p.is_file()) {
                    let version = desc.version.clone().unwrap_or_else(|| "system".to_string());
                    debug!(%engine, path = %exe.display(), %version, "Using cached binary");
                    return Ok((exe.to_path_buf(), version));
                }
            }
        }

        let version = version.unwrap_or(profile.default_version);
        let dir = self.provisioner.provision(engine, version, on_progress).await?;
        self.binaries.insert(engine, self.provisioner.resolve(engine));
        Ok((dir.join(profile.executable), version.to_string()))
    }

    /// One-time data directory setup, skipped when the marker exists.
    async fn initialize(&self, layout: &InstanceLayout, exe: &Path) -> Result<()> {
        let engine = layout.engine;
        let profile = engine.profile();
        let marker = profile.marker_path(layout);
        if marker.as_deref().is_some_and(Path::exists) {
            debug!(%engine, data = %layout.data_path.display(), "Data directory already initialized");
            return Ok(());
        }

        let data = layout.data_path.display().to_string();
        match profile.init {
            InitStep::None => {}
            InitStep::InitDb => {
                let initdb = exe.with_file_name("initdb");
                let spec = self.privilege.run_as(
                    initdb,
                    ["-D".to_string(), data, "-U".into(), "postgres".into(), "--auth=trust".into()],
                );
                self.run_init(engine, &spec).await?;

                let hba = layout.data_path.join("pg_hba.conf");
                fs::write(&hba, pg_hba(HbaMethod::Trust))
                    .io_context(|| format!("writing {}", hba.display()))?;
                self.privilege.fix_ownership(&layout.data_path);
                info!(%engine, "Configured pg_hba.conf for trust authentication");
            }
            InitStep::InitializeInsecure => {
                let spec = self
                    .privilege
                    .run_as(exe, ["--initialize-insecure".to_string(), format!("--datadir={data}")]);
                self.run_init(engine, &spec).await?;
                self.privilege.fix_ownership(&layout.data_path);
            }
            InitStep::WriteConfig => {
                if let Some(path) = marker {
                    fs::write(&path, redis_config(layout))
                        .io_context(|| format!("writing {}", path.display()))?;
                    self.privilege.fix_ownership(&layout.data_path);
                    info!(%engine, path = %path.display(), "Wrote server configuration");
                }
            }
        }
        Ok(())
    }

    async fn run_init(&self, engine: Engine, spec: &LaunchSpec) -> Result<()> {
        let program = spec.program_name();
        info!(%engine, program = %program, user = ?spec.account.as_ref().map(|a| &a.name), "Initializing data directory");

        let child = self
            .supervisor
            .launcher()
            .launch(spec)
            .map_err(|e| OrchestratorError::Initialization {
                engine,
                code: None,
                output: format!("{program} could not start: {e}"),
            })?;
        let output = child
            .wait_with_output()
            .await
            .io_context(|| format!("waiting for {program}"))?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        for line in String::from_utf8_lossy(&combined).lines() {
            debug!(%engine, program = %program, "{line}");
        }

        if !output.status.success() {
            return Err(OrchestratorError::Initialization {
                engine,
                code: output.status.code(),
                output: output_tail(&combined, INIT_OUTPUT_TAIL),
            });
        }
        info!(%engine, program = %program, "Initialization complete");
        Ok(())
    }

    fn spawn_server(&mut self, id: &str, layout: &InstanceLayout, exe: &Path) -> Result<u32> {
        purge_stale_files(layout);
        let args = layout.args();
        debug!(id = %id, program = %exe.display(), ?args, "Starting server");
        let spec = self.privilege.run_as(exe, args);
        self.supervisor
            .spawn(id, &spec)
            .map_err(|source| OrchestratorError::RuntimeProcess {
                id: id.to_string(),
                source,
            })
    }

    /// Start a stopped instance from its stored record. Running instances
    /// are returned unchanged.
    pub fn start_instance(&mut self, id: &str) -> Result<InstanceRecord> {
        self.process_events()?;
        let mut records = self.registry.load()?;
        let idx = position(&records, id)?;
        if records[idx].is_running() {
            debug!(id = %id, "Instance already running");
            return Ok(records[idx].clone());
        }

        let exe = self
            .record_executable(&records[idx])
            .ok_or(OrchestratorError::BinaryNotInstalled(records[idx].engine))?;

        let layout = records[idx].layout();
        self.privilege.fix_ownership(records[idx].instance_dir());
        let pid = self.spawn_server(id, &layout, &exe)?;

        let rec = &mut records[idx];
        rec.status = InstanceStatus::Running;
        rec.pid = Some(pid);
        let started = rec.clone();
        self.registry.save(&records)?;

        info!(id = %id, pid, "Instance started");
        Ok(started)
    }

    /// Ask a running instance to stop; it is force-killed if still alive
    /// after the grace period. The record is marked stopped right away.
    pub fn stop_instance(&mut self, id: &str) -> Result<InstanceRecord> {
        self.process_events()?;
        let mut records = self.registry.load()?;
        let idx = position(&records, id)?;
        if !records[idx].is_running() {
            debug!(id = %id, "Instance not running");
            return Ok(records[idx].clone());
        }

        let runtime = |source: io::Error| OrchestratorError::RuntimeProcess {
            id: id.to_string(),
            source,
        };
        let grace = self.config.grace_period();
        info!(id = %id, pid = ?records[idx].pid, "Stopping instance");
        if !self.supervisor.stop(id, grace).map_err(runtime)? {
            // Left running by an earlier session: no handle, so no forced kill.
            match records[idx].pid {
                Some(pid) if self.owns_process(&records[idx], pid) => {
                    warn!(id = %id, pid, "Instance is not supervised, sending SIGTERM only");
                    self.supervisor.launcher().terminate(pid).map_err(runtime)?;
                }
                Some(pid) => {
                    warn!(id = %id, pid, "Recorded pid is not this instance's server, not signalling it");
                }
                None => {}
            }
        }

        let rec = &mut records[idx];
        rec.status = InstanceStatus::Stopped;
        rec.pid = None;
        rec.append_log("\n[Stopped by user]", self.config.max_log_bytes);
        let stopped = rec.clone();
        self.registry.save(&records)?;
        Ok(stopped)
    }

    /// Stop the instance if needed, then remove its directory and record.
    pub fn delete_instance(&mut self, id: &str) -> Result<InstanceRecord> {
        self.process_events()?;
        let records = self.registry.load()?;
        let idx = position(&records, id)?;
        if records[idx].is_running() {
            if let Err(e) = self.stop_instance(id) {
                warn!(id = %id, error = %e, "Could not stop instance before deleting it");
            }
        }

        let mut records = self.registry.load()?;
        let idx = position(&records, id)?;
        let rec = &records[idx];
        let dir = rec.instance_dir().to_path_buf();
        if rec.id != instance_id(rec.engine, rec.port)
            || dir != instance_dir(&self.config.data_root, rec.engine, rec.port)
        {
            warn!(id = %id, path = %dir.display(), "Record points outside its instance directory");
            return Err(OrchestratorError::ForeignPath {
                id: id.to_string(),
                path: dir,
            });
        }
        if dir.exists() {
            info!(id = %id, path = %dir.display(), "Deleting instance data");
            fs::remove_dir_all(&dir).io_context(|| format!("removing {}", dir.display()))?;
        }

        let removed = records.remove(idx);
        self.registry.save(&records)?;
        info!(id = %id, "Instance deleted");
        Ok(removed)
    }

    /// How a client connects to the instance.
    pub fn connection_info(&self, id: &str) -> Result<ConnectionInfo> {
        let records = self.registry.load()?;
        let rec = &records[position(&records, id)?];
        Ok((rec.engine.profile().connection_info)(rec.port, rec.password_set))
    }

    /// Server output captured so far.
    pub fn instance_logs(&mut self, id: &str) -> Result<String> {
        self.process_events()?;
        let mut records = self.registry.load()?;
        let idx = position(&records, id)?;
        Ok(records.swap_remove(idx).logs)
    }

    /// Mark the instance as password-protected. For postgres, `pg_hba.conf`
    /// is switched to md5; the change applies after a restart.
    pub fn set_password_enabled(&mut self, id: &str) -> Result<InstanceRecord> {
        self.process_events()?;
        let mut records = self.registry.load()?;
        let idx = position(&records, id)?;
        let rec = &mut records[idx];

        if rec.engine == Engine::Postgres {
            let hba = rec.data_path.join("pg_hba.conf");
            fs::write(&hba, pg_hba(HbaMethod::Md5))
                .io_context(|| format!("writing {}", hba.display()))?;
            warn!(id = %id, "pg_hba.conf switched to md5, restart the instance to apply it");
        }
        rec.password_set = true;
        let updated = rec.clone();
        self.registry.save(&records)?;
        Ok(updated)
    }

    /// Stop every running instance, continuing past failures.
    pub fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if let Err(e) = self.process_events() {
            warn!(error = %e, "Could not apply pending process events");
        }

        let running: Vec<String> = match self.registry.load() {
            Ok(records) => records.into_iter().filter(|r| r.is_running()).map(|r| r.id).collect(),
            Err(e) => {
                warn!(error = %e, "Could not read registry, stopping supervised processes only");
                let tracked = self.supervisor.tracked();
                let failures = self.supervisor.stop_all(self.config.grace_period());
                for id in tracked {
                    if !failures.iter().any(|(failed, _)| *failed == id) {
                        report.stopped.push(id);
                    }
                }
                report
                    .failed
                    .extend(failures.into_iter().map(|(id, e)| (id, e.to_string())));
                Vec::new()
            }
        };

        for id in running {
            match self.stop_instance(&id) {
                Ok(_) => report.stopped.push(id),
                Err(e) => {
                    warn!(id = %id, error = %e, "Could not stop instance during cleanup");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        info!(stopped = report.stopped.len(), failed = report.failed.len(), "Cleanup finished");
        report
    }

    /// [`cleanup`](Self::cleanup), then wait for the stopped processes to
    /// exit and record their exits.
    pub async fn shutdown(&mut self) -> CleanupReport {
        let report = self.cleanup();
        self.supervisor.drain().await;
        if let Err(e) = self.process_events() {
            warn!(error = %e, "Could not record final process exits");
        }
        report
    }

    /// Apply every queued supervisor event in one registry write.
    pub fn process_events(&mut self) -> Result<usize> {
        let mut pending = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            pending.push(event);
        }
        self.apply_all(&pending)?;
        Ok(pending.len())
    }

    /// Wait for the next supervisor event and return it, already applied.
    ///
    /// Whatever else is queued at that moment is applied in the same
    /// registry write and handed out by the following calls.
    pub async fn next_event(&mut self) -> Result<Option<SupervisorEvent>> {
        if let Some(event) = self.applied.pop_front() {
            return Ok(Some(event));
        }
        let Some(first) = self.events.recv().await else {
            return Ok(None);
        };
        let mut pending = vec![first];
        while let Ok(event) = self.events.try_recv() {
            pending.push(event);
        }
        self.apply_all(&pending)?;

        let mut pending = pending.into_iter();
        let first = pending.next();
        self.applied.extend(pending);
        Ok(first)
    }

    fn apply_all(&mut self, events: &[SupervisorEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut records = self.registry.load()?;
        for event in events {
            self.apply_event(&mut records, event);
        }
        debug!(events = events.len(), "Applied supervisor events");
        self.registry.save(&records)
    }

    /// The single place where process activity changes instance state.
    ///
    /// Exit and failure only affect a record whose pid matches, so events
    /// from an earlier process of the same id cannot stop its successor.
    fn apply_event(&mut self, records: &mut [InstanceRecord], event: &SupervisorEvent) {
        let max = self.config.max_log_bytes;
        let rec = records.iter_mut().find(|r| r.id == event.id());

        match event {
            SupervisorEvent::Output { line, .. } => {
                if let Some(rec) = rec {
                    rec.append_log(line, max);
                    rec.append_log("\n", max);
                }
            }
            SupervisorEvent::Exited { id, pid, code, signal } => {
                self.supervisor.forget(id, *pid);
                let Some(rec) = rec.filter(|r| r.pid == Some(*pid)) else {
                    debug!(id = %id, pid, "Exit of a process no longer recorded");
                    return;
                };
                let how = match (code, signal) {
                    (Some(code), _) => format!("with code {code}"),
                    (None, Some(signal)) => format!("on signal {signal}"),
                    (None, None) => "with unknown status".to_string(),
                };
                warn!(id = %id, pid, "Instance exited {how}");
                rec.status = InstanceStatus::Stopped;
                rec.pid = None;
                rec.append_log(&format!("\n[Process exited {how}]\n"), max);
            }
            SupervisorEvent::Failed { id, pid, error } => {
                self.supervisor.forget(id, *pid);
                if let Some(rec) = rec.filter(|r| r.pid == Some(*pid)) {
                    rec.append_log(&format!("\n[Process error: {error}]\n"), max);
                }
            }
        }
    }
}

fn position(records: &[InstanceRecord], id: &str) -> Result<usize> {
    records
        .iter()
        .position(|r| r.id == id)
        .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
}

/// The requested port if it is free on loopback, otherwise an ephemeral one.
fn pick_port(requested: Option<u16>) -> Result<u16> {
    if let Some(port) = requested {
        if TcpListener::bind((LOOPBACK, port)).is_ok() {
            return Ok(port);
        }
        warn!(port, "Requested port is in use, allocating another");
    }
    let listener = TcpListener::bind((LOOPBACK, 0)).io_context(|| "allocating a free port")?;
    let port = listener
        .local_addr()
        .io_context(|| "reading allocated port")?
        .port();
    Ok(port)
}

fn purge_stale_files(layout: &InstanceLayout) {
    for path in layout.stale_files() {
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "Removed stale file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove stale file"),
        }
    }
}
