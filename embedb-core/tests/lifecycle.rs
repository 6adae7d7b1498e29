//! Instance lifecycle tests against a throwaway data root.
//!
//! Engine servers and init tools are replaced by small shell stand-ins
//! through a fake [`Launcher`]; archives come from a local mirror directory.
//!
//! ```sh
//! cargo test -p embedb-core --test lifecycle
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use embedb_core::launcher::{is_alive, send_signal};
use embedb_core::{
    Account, Engine, InstanceRecord, InstanceRegistry, InstanceStatus, LaunchSpec, Launcher,
    MirrorArchiveSource, Orchestrator, OrchestratorConfig, OrchestratorError, PrivilegeResolver,
    SupervisorEvent, SystemLauncher,
};
use nix::sys::signal::Signal;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Fakes and helpers
// ---------------------------------------------------------------------------

/// Runs `/bin/sh` stand-ins instead of real engine binaries and records
/// every spec it was asked to launch.
#[derive(Default)]
struct FakeLauncher {
    spawned: Mutex<Vec<LaunchSpec>>,
    refused: Mutex<HashSet<u32>>,
    fail_init: AtomicBool,
    ignore_sigterm: AtomicBool,
    crash: AtomicBool,
}

impl FakeLauncher {
    fn programs(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(LaunchSpec::program_name)
            .collect()
    }

    fn refuse_termination(&self, pid: u32) {
        self.refused.lock().unwrap().insert(pid);
    }

    fn allow_termination(&self) {
        self.refused.lock().unwrap().clear();
    }

    fn script(&self, spec: &LaunchSpec) -> &'static str {
        let name = spec.program_name();
        let init = name == "initdb" || spec.args.iter().any(|a| a == "--initialize-insecure");
        if init {
            if self.fail_init.load(Ordering::SeqCst) {
                return "echo \"$0: could not create directory\" >&2; exit 1";
            }
            return if name == "initdb" {
                // initdb -D <data> -U postgres --auth=trust
                "echo 17 > \"$2/PG_VERSION\" && echo 'Success.'"
            } else {
                // mysqld --initialize-insecure --datadir=<data>
                "mkdir -p \"${2#--datadir=}/mysql\""
            };
        }
        if self.crash.load(Ordering::SeqCst) {
            "echo \"$0 failing\"; exit 3"
        } else if self.ignore_sigterm.load(Ordering::SeqCst) {
            "trap '' TERM; echo \"$0 ready\"; while :; do sleep 1; done"
        } else {
            "echo \"$0 ready\"; exec sleep 600"
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Child> {
        self.spawned.lock().unwrap().push(spec.clone());
        Command::new("/bin/sh")
            .arg("-c")
            .arg(self.script(spec))
            .arg(spec.program_name())
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        if self.refused.lock().unwrap().contains(&pid) {
            return Err(io::Error::from_raw_os_error(nix::libc::EPERM));
        }
        send_signal(pid, Signal::SIGTERM)
    }
}

fn test_config(root: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::with_data_root(root.join("data"));
    config.system_binaries = false;
    config.grace_period_ms = 500;
    config
}

fn same_user() -> PrivilegeResolver {
    let me = Account::current();
    PrivilegeResolver::from_accounts(me.clone(), me)
}

fn install_fake_binary(config: &OrchestratorConfig, engine: Engine) -> PathBuf {
    let profile = engine.profile();
    let exe = config
        .binaries_dir()
        .join(profile.versioned_dir_name(profile.default_version))
        .join(profile.executable);
    fs::create_dir_all(exe.parent().unwrap()).unwrap();
    fs::write(&exe, "#!/bin/sh\nexec sleep 600\n").unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
    exe
}

struct Harness {
    _dir: TempDir,
    config: OrchestratorConfig,
    launcher: Arc<FakeLauncher>,
    orch: Orchestrator,
}

fn harness(engines: &[Engine]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    for engine in engines {
        install_fake_binary(&config, *engine);
    }
    let launcher = Arc::new(FakeLauncher::default());
    let orch = Orchestrator::with_parts(
        config.clone(),
        same_user(),
        launcher.clone(),
        Arc::new(MirrorArchiveSource::new(dir.path().join("mirror"))),
    )
    .unwrap();
    Harness {
        _dir: dir,
        config,
        launcher,
        orch,
    }
}

/// `preferred` if nothing listens on it, otherwise any free port.
fn free_port(preferred: u16) -> u16 {
    if TcpListener::bind(("127.0.0.1", preferred)).is_ok() {
        return preferred;
    }
    TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn create(orch: &mut Orchestrator, engine: Engine, port: Option<u16>) -> InstanceRecord {
    orch.create_instance(engine, port, None, &mut |_| {}).await.unwrap()
}

async fn wait_for<F>(orch: &mut Orchestrator, mut pred: F) -> SupervisorEvent
where
    F: FnMut(&SupervisorEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = orch.next_event().await.unwrap().expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for supervisor event")
}

fn record(orch: &mut Orchestrator, id: &str) -> InstanceRecord {
    orch.list_instances()
        .unwrap()
        .into_iter()
        .find(|r| r.id == id)
        .unwrap()
}

/// A record as an earlier session would have saved it.
fn stored_record(config: &OrchestratorConfig, engine: Engine, port: u16, pid: Option<u32>) -> InstanceRecord {
    let id = format!("{engine}@{port}");
    InstanceRecord {
        data_path: config.data_root.join(&id).join("data"),
        id,
        engine,
        port,
        version: engine.profile().default_version.to_string(),
        socket_dir: None,
        username: None,
        status: if pid.is_some() {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        },
        pid,
        logs: String::new(),
        password_set: false,
    }
}

fn save_records(config: &OrchestratorConfig, records: &[InstanceRecord]) {
    fs::create_dir_all(&config.data_root).unwrap();
    InstanceRegistry::new(config.registry_path()).save(records).unwrap();
}

fn system_orchestrator(dir: &Path, config: &OrchestratorConfig, launcher: Arc<dyn Launcher>) -> Orchestrator {
    Orchestrator::with_parts(
        config.clone(),
        same_user(),
        launcher,
        Arc::new(MirrorArchiveSource::new(dir.join("mirror"))),
    )
    .unwrap()
}

fn have_proc() -> bool {
    Path::new("/proc/self/cmdline").exists()
}

// ---------------------------------------------------------------------------
// Creation and initialization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_twice_does_not_reinitialize() {
    let mut h = harness(&[Engine::Postgres]);
    let port = free_port(5433);

    let first = create(&mut h.orch, Engine::Postgres, Some(port)).await;
    assert_eq!(first.status, InstanceStatus::Running);
    assert_eq!(first.username.as_deref(), Some("postgres"));
    assert!(first.socket_dir.is_some());
    assert!(first.data_path.join("PG_VERSION").exists());
    assert!(first.data_path.join("pg_hba.conf").exists());
    assert_eq!(h.launcher.programs(), vec!["initdb", "postgres"]);

    let again = create(&mut h.orch, Engine::Postgres, Some(port)).await;
    assert_eq!(again.id, first.id);
    assert_eq!(again.pid, first.pid);

    h.orch.stop_instance(&first.id).unwrap();
    let restarted = create(&mut h.orch, Engine::Postgres, Some(port)).await;
    assert_eq!(restarted.status, InstanceStatus::Running);
    assert_eq!(h.launcher.programs(), vec!["initdb", "postgres", "postgres"]);
    assert_eq!(h.orch.list_instances().unwrap().len(), 1);

    assert!(h.orch.shutdown().await.is_clean());
}

#[tokio::test]
async fn test_existing_pg_version_skips_initdb() {
    let mut h = harness(&[Engine::Postgres]);
    let port = free_port(5433);
    let data = h.config.data_root.join(format!("postgres@{port}")).join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("PG_VERSION"), "17\n").unwrap();

    let rec = create(&mut h.orch, Engine::Postgres, Some(port)).await;
    assert_eq!(rec.port, port);
    assert_eq!(rec.status, InstanceStatus::Running);
    assert_eq!(h.launcher.programs(), vec!["postgres"]);

    let spawned = h.launcher.spawned.lock().unwrap()[0].clone();
    assert_eq!(&spawned.args[..4], &["-D".to_string(), data.display().to_string(), "-p".into(), port.to_string()]);

    assert!(h.orch.shutdown().await.is_clean());
}

#[tokio::test]
async fn test_mysql_initializes_insecure_once() {
    let mut h = harness(&[Engine::Mysql]);
    let rec = create(&mut h.orch, Engine::Mysql, None).await;
    assert!(rec.data_path.join("mysql").is_dir());
    assert_eq!(rec.username.as_deref(), Some("root"));
    assert_eq!(h.launcher.programs(), vec!["mysqld", "mysqld"]);

    let init = h.launcher.spawned.lock().unwrap()[0].clone();
    assert_eq!(init.args[0], "--initialize-insecure");
    assert_eq!(init.args[1], format!("--datadir={}", rec.data_path.display()));

    assert!(h.orch.shutdown().await.is_clean());
}

#[tokio::test]
async fn test_initialization_failure_leaves_no_record() {
    let mut h = harness(&[Engine::Postgres]);
    h.launcher.fail_init.store(true, Ordering::SeqCst);

    let err = h
        .orch
        .create_instance(Engine::Postgres, None, None, &mut |_| {})
        .await
        .unwrap_err();
    match err {
        OrchestratorError::Initialization { engine, code, output } => {
            assert_eq!(engine, Engine::Postgres);
            assert_eq!(code, Some(1));
            assert!(output.contains("could not create directory"), "{output}");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(h.orch.list_instances().unwrap().is_empty());
    let leftovers: Vec<_> = fs::read_dir(&h.config.data_root)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("postgres@"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_busy_port_falls_back_to_free_one() {
    let mut h = harness(&[Engine::Mongo]);
    let busy = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = busy.local_addr().unwrap().port();

    let rec = create(&mut h.orch, Engine::Mongo, Some(port)).await;
    assert_ne!(rec.port, port);
    assert_eq!(rec.id, format!("mongo@{}", rec.port));

    assert!(h.orch.shutdown().await.is_clean());
}

#[tokio::test]
async fn test_redis_config_written_and_output_captured() {
    let mut h = harness(&[Engine::Redis]);
    let rec = create(&mut h.orch, Engine::Redis, None).await;

    let conf = fs::read_to_string(rec.data_path.join("redis.conf")).unwrap();
    assert!(conf.contains(&format!("port {}", rec.port)));
    assert!(conf.contains("bind 127.0.0.1"));

    wait_for(&mut h.orch, |e| matches!(e, SupervisorEvent::Output { line, .. } if line.contains("ready"))).await;
    assert!(h.orch.instance_logs(&rec.id).unwrap().contains("redis-server ready"));

    assert!(h.orch.shutdown().await.is_clean());
}

// ---------------------------------------------------------------------------
// Start, stop, delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_then_start_changes_pid() {
    let mut h = harness(&[Engine::Mongo]);
    let rec = create(&mut h.orch, Engine::Mongo, None).await;
    let first_pid = rec.pid.unwrap();

    let stopped = h.orch.stop_instance(&rec.id).unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    assert_eq!(stopped.pid, None);
    assert!(stopped.logs.ends_with("[Stopped by user]"));

    // Stopping again is a no-op.
    assert_eq!(h.orch.stop_instance(&rec.id).unwrap().status, InstanceStatus::Stopped);

    let started = h.orch.start_instance(&rec.id).unwrap();
    assert_eq!(started.status, InstanceStatus::Running);
    assert_ne!(started.pid, Some(first_pid));

    h.orch.shutdown().await;
    let rec = record(&mut h.orch, &rec.id);
    assert_eq!(rec.status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn test_exit_of_old_process_keeps_new_one_running() {
    let mut h = harness(&[Engine::Mongo]);
    let rec = create(&mut h.orch, Engine::Mongo, None).await;
    let old_pid = rec.pid.unwrap();

    h.orch.stop_instance(&rec.id).unwrap();
    let started = h.orch.start_instance(&rec.id).unwrap();

    wait_for(&mut h.orch, |e| matches!(e, SupervisorEvent::Exited { pid, .. } if *pid == old_pid)).await;
    let current = record(&mut h.orch, &rec.id);
    assert_eq!(current.status, InstanceStatus::Running);
    assert_eq!(current.pid, started.pid);

    assert!(h.orch.shutdown().await.is_clean());
}

#[tokio::test]
async fn test_delete_removes_data_regardless_of_state() {
    let mut h = harness(&[Engine::Mongo, Engine::Redis]);
    let running = create(&mut h.orch, Engine::Mongo, None).await;
    let stopped = create(&mut h.orch, Engine::Redis, None).await;
    h.orch.stop_instance(&stopped.id).unwrap();

    for rec in [&running, &stopped] {
        let removed = h.orch.delete_instance(&rec.id).unwrap();
        assert_eq!(removed.id, rec.id);
        assert!(!rec.data_path.exists());
        assert!(!rec.data_path.parent().unwrap().exists());
    }
    assert!(h.orch.list_instances().unwrap().is_empty());
    assert!(matches!(
        h.orch.delete_instance(&running.id),
        Err(OrchestratorError::NotFound(_))
    ));

    h.orch.shutdown().await;
}

#[tokio::test]
async fn test_unexpected_exit_marks_stopped() {
    let mut h = harness(&[Engine::Mongo]);
    h.launcher.crash.store(true, Ordering::SeqCst);
    let rec = create(&mut h.orch, Engine::Mongo, None).await;

    wait_for(&mut h.orch, |e| matches!(e, SupervisorEvent::Exited { .. })).await;
    let after = record(&mut h.orch, &rec.id);
    assert_eq!(after.status, InstanceStatus::Stopped);
    assert_eq!(after.pid, None);
    assert!(after.logs.contains("[Process exited with code 3]"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !h.orch.instance_logs(&rec.id).unwrap().contains("mongod failing") {
        assert!(Instant::now() < deadline, "output never captured");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_start_without_binary_fails() {
    let mut h = harness(&[Engine::Mongo]);
    let rec = create(&mut h.orch, Engine::Mongo, None).await;
    h.orch.stop_instance(&rec.id).unwrap();

    fs::remove_dir_all(h.config.binaries_dir().join("mongo-6.0.6")).unwrap();
    assert!(!h.orch.refresh_binaries()[&Engine::Mongo].installed);

    assert!(matches!(
        h.orch.start_instance(&rec.id),
        Err(OrchestratorError::BinaryNotInstalled(Engine::Mongo))
    ));
    assert_eq!(record(&mut h.orch, &rec.id).status, InstanceStatus::Stopped);
    h.orch.shutdown().await;
}

#[tokio::test]
async fn test_unknown_id_is_not_found() {
    let mut h = harness(&[]);
    let id = "redis@1";
    assert!(matches!(h.orch.start_instance(id), Err(OrchestratorError::NotFound(_))));
    assert!(matches!(h.orch.stop_instance(id), Err(OrchestratorError::NotFound(_))));
    assert!(matches!(h.orch.connection_info(id), Err(OrchestratorError::NotFound(_))));
    assert!(matches!(h.orch.instance_logs(id), Err(OrchestratorError::NotFound(_))));
    assert!(matches!(h.orch.set_password_enabled(id), Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn test_delete_refuses_foreign_data_path() {
    let mut h = harness(&[]);
    let foreign = h.config.data_root.parent().unwrap().join("elsewhere");
    fs::create_dir_all(foreign.join("data")).unwrap();
    fs::write(foreign.join("data").join("keep.txt"), "keep").unwrap();

    let mut rec = stored_record(&h.config, Engine::Mongo, 27018, None);
    rec.data_path = foreign.join("data");
    save_records(&h.config, &[rec]);

    let err = h.orch.delete_instance("mongo@27018").unwrap_err();
    assert!(matches!(err, OrchestratorError::ForeignPath { ref id, .. } if id == "mongo@27018"));
    assert!(foreign.join("data").join("keep.txt").exists());
    assert_eq!(h.orch.list_instances().unwrap().len(), 1);
}

fn install_unexecutable_binary(config: &OrchestratorConfig, engine: Engine) {
    let exe = install_fake_binary(config, engine);
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o644)).unwrap();
}

#[tokio::test]
async fn test_unexecutable_binary_on_create_leaves_no_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    install_unexecutable_binary(&config, Engine::Mongo);
    let mut orch = system_orchestrator(dir.path(), &config, Arc::new(SystemLauncher));

    let err = orch
        .create_instance(Engine::Mongo, None, None, &mut |_| {})
        .await
        .unwrap_err();
    match err {
        OrchestratorError::RuntimeProcess { id, source } => {
            assert!(id.starts_with("mongo@"), "{id}");
            assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(orch.list_instances().unwrap().is_empty());
    let leftovers = fs::read_dir(&config.data_root)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("mongo@"))
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_unexecutable_binary_on_start_keeps_record_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    install_unexecutable_binary(&config, Engine::Mongo);
    save_records(&config, &[stored_record(&config, Engine::Mongo, 27019, None)]);
    let mut orch = system_orchestrator(dir.path(), &config, Arc::new(SystemLauncher));

    assert!(matches!(
        orch.start_instance("mongo@27019"),
        Err(OrchestratorError::RuntimeProcess { ref id, .. }) if id == "mongo@27019"
    ));
    let rec = record(&mut orch, "mongo@27019");
    assert_eq!(rec.status, InstanceStatus::Stopped);
    assert_eq!(rec.pid, None);
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sigterm_ignored_is_killed_after_grace() {
    let mut h = harness(&[Engine::Mongo]);
    h.launcher.ignore_sigterm.store(true, Ordering::SeqCst);
    let rec = create(&mut h.orch, Engine::Mongo, None).await;
    let pid = rec.pid.unwrap();

    wait_for(&mut h.orch, |e| matches!(e, SupervisorEvent::Output { line, .. } if line.contains("ready"))).await;

    let grace = h.config.grace_period();
    let start = Instant::now();
    h.orch.stop_instance(&rec.id).unwrap();
    assert!(h.orch.shutdown().await.is_clean());
    let elapsed = start.elapsed();

    assert!(!is_alive(pid));
    assert!(elapsed >= grace, "killed before the grace period: {elapsed:?}");
    assert!(elapsed <= grace + Duration::from_millis(500), "kill took too long: {elapsed:?}");
}

#[tokio::test]
async fn test_cleanup_continues_past_failure() {
    let mut h = harness(&[Engine::Mongo]);
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(create(&mut h.orch, Engine::Mongo, None).await);
    }
    let stubborn = &ids[1];
    h.launcher.refuse_termination(stubborn.pid.unwrap());

    let report = h.orch.cleanup();
    assert_eq!(report.stopped.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, stubborn.id);

    for rec in &ids {
        let expected = if rec.id == stubborn.id {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        };
        assert_eq!(record(&mut h.orch, &rec.id).status, expected);
    }

    h.launcher.allow_termination();
    let report = h.orch.shutdown().await;
    assert_eq!(report.stopped, vec![stubborn.id.clone()]);
}

#[tokio::test]
async fn test_unreadable_registry_still_stops_supervised_processes() {
    let mut h = harness(&[Engine::Mongo]);
    let rec = create(&mut h.orch, Engine::Mongo, None).await;
    let pid = rec.pid.unwrap();

    fs::write(h.config.registry_path(), "{not json").unwrap();
    let report = h.orch.shutdown().await;
    assert_eq!(report.stopped, vec![rec.id.clone()]);
    assert!(report.is_clean());
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_next_event_returns_every_event_already_applied() {
    let mut h = harness(&[Engine::Mongo]);
    h.launcher.crash.store(true, Ordering::SeqCst);
    let rec = create(&mut h.orch, Engine::Mongo, None).await;
    // Let output and exit queue up together.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (mut saw_output, mut saw_exit) = (false, false);
    while !(saw_output && saw_exit) {
        let event = timeout(Duration::from_secs(10), h.orch.next_event())
            .await
            .expect("timed out waiting for supervisor event")
            .unwrap()
            .expect("event channel closed");
        match event {
            SupervisorEvent::Output { line, .. } if line == "mongod failing" => saw_output = true,
            SupervisorEvent::Exited { .. } => saw_exit = true,
            _ => {}
        }
    }

    let stored = InstanceRegistry::new(h.config.registry_path()).load().unwrap();
    let stored = stored.iter().find(|r| r.id == rec.id).unwrap();
    assert_eq!(stored.status, InstanceStatus::Stopped);
    assert!(stored.logs.contains("mongod failing"));
}

#[tokio::test]
async fn test_traversing_version_is_rejected_before_provisioning() {
    let mut h = harness(&[Engine::Mongo]);
    let victim = h.config.data_root.parent().unwrap().join("victim");
    fs::create_dir_all(&victim).unwrap();
    fs::write(victim.join("important.txt"), "keep").unwrap();

    let err = h
        .orch
        .create_instance(Engine::Mongo, None, Some("6.0.6/../../../victim"), &mut |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidVersion { engine: Engine::Mongo, .. }));
    assert!(victim.join("important.txt").exists());
    assert!(h.orch.list_instances().unwrap().is_empty());
    assert!(h.launcher.programs().is_empty());
}

// ---------------------------------------------------------------------------
// Connection info and passwords
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connection_info_is_stable() {
    let mut h = harness(&[Engine::Mysql]);
    let rec = create(&mut h.orch, Engine::Mysql, None).await;

    let first = h.orch.connection_info(&rec.id).unwrap();
    let second = h.orch.connection_info(&rec.id).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.host, "127.0.0.1");
    assert_eq!(first.port, rec.port);
    assert_eq!(first.connection_string, format!("mysql://root@127.0.0.1:{}", rec.port));

    assert!(h.orch.shutdown().await.is_clean());
}

#[tokio::test]
async fn test_enable_password_switches_postgres_to_md5() {
    let mut h = harness(&[Engine::Postgres]);
    let rec = create(&mut h.orch, Engine::Postgres, None).await;
    let hba = rec.data_path.join("pg_hba.conf");
    assert!(fs::read_to_string(&hba).unwrap().contains("trust"));

    let updated = h.orch.set_password_enabled(&rec.id).unwrap();
    assert!(updated.password_set);
    let content = fs::read_to_string(&hba).unwrap();
    assert!(content.contains("md5"));
    assert!(!content.contains("trust"));

    let info = h.orch.connection_info(&rec.id).unwrap();
    assert_eq!(info.password.as_deref(), Some("(password required)"));

    assert!(h.orch.shutdown().await.is_clean());
}

// ---------------------------------------------------------------------------
// Startup reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dead_running_records_are_reconciled_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    fs::create_dir_all(&config.data_root).unwrap();

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();
    save_records(&config, &[stored_record(&config, Engine::Redis, 6390, Some(dead_pid))]);

    let mut orch = system_orchestrator(dir.path(), &config, Arc::new(FakeLauncher::default()));

    let rec = record(&mut orch, "redis@6390");
    assert_eq!(rec.status, InstanceStatus::Stopped);
    assert_eq!(rec.pid, None);
    assert!(rec.logs.contains("process not found at startup"));
}

#[tokio::test]
async fn test_reused_pid_is_never_signalled() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut bystander = std::process::Command::new("sleep").arg("600").spawn().unwrap();
    let pid = bystander.id();
    save_records(&config, &[stored_record(&config, Engine::Redis, 6390, Some(pid))]);

    let mut orch = system_orchestrator(dir.path(), &config, Arc::new(SystemLauncher));
    let rec = record(&mut orch, "redis@6390");
    assert_eq!(rec.status, InstanceStatus::Stopped);
    assert_eq!(rec.pid, None);

    // Same pid recorded while this orchestrator is already up.
    save_records(&config, &[stored_record(&config, Engine::Mongo, 27018, Some(pid))]);
    let report = orch.cleanup();
    assert_eq!(report.stopped, vec!["mongo@27018".to_string()]);
    assert_eq!(record(&mut orch, "mongo@27018").status, InstanceStatus::Stopped);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bystander.try_wait().unwrap().is_none(), "unrelated process was signalled");
    bystander.kill().unwrap();
    bystander.wait().unwrap();
}

#[tokio::test]
async fn test_server_left_by_earlier_session_is_stopped() {
    if !have_proc() {
        eprintln!("skipping: /proc is not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let stored = stored_record(&config, Engine::Redis, 6391, Some(0));
    let mut server = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg("while :; do sleep 1; done")
        .arg("redis-server")
        .arg(stored.data_path.join("redis.conf"))
        .spawn()
        .unwrap();
    let pid = server.id();
    save_records(&config, &[InstanceRecord { pid: Some(pid), ..stored }]);

    let mut orch = system_orchestrator(dir.path(), &config, Arc::new(FakeLauncher::default()));
    let rec = record(&mut orch, "redis@6391");
    assert_eq!(rec.status, InstanceStatus::Running);
    assert_eq!(rec.pid, Some(pid));

    let stopped = orch.stop_instance("redis@6391").unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);

    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        if let Some(status) = server.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "server was not signalled");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
}

// ---------------------------------------------------------------------------
// Provisioning end to end
// ---------------------------------------------------------------------------

fn have_tool(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// A source tarball whose `make` produces a runnable `src/redis-server`.
fn build_redis_source_archive(mirror: &Path, version: &str) {
    let src = mirror.join("src-tree").join(format!("redis-{version}"));
    fs::create_dir_all(&src).unwrap();
    fs::write(
        src.join("Makefile"),
        "all:\n\tmkdir -p src\n\tprintf '#!/bin/sh\\nexec sleep 600\\n' > src/redis-server\n",
    )
    .unwrap();

    let status = std::process::Command::new("tar")
        .arg("-czf")
        .arg(mirror.join(format!("redis-{version}.tar.gz")))
        .arg("-C")
        .arg(mirror.join("src-tree"))
        .arg(format!("redis-{version}"))
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_redis_is_downloaded_compiled_and_started() {
    if !have_tool("tar") || !have_tool("make") {
        eprintln!("skipping: tar and make are required");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let mirror = dir.path().join("mirror");
    build_redis_source_archive(&mirror, "7.4.1");

    let config = test_config(dir.path());
    let mut orch = Orchestrator::with_parts(
        config.clone(),
        same_user(),
        Arc::new(SystemLauncher),
        Arc::new(MirrorArchiveSource::new(&mirror)),
    )
    .unwrap();
    assert!(!orch.list_binaries()[&Engine::Redis].installed);

    let port = free_port(6380);
    let mut progress = Vec::new();
    let rec = orch
        .create_instance(Engine::Redis, Some(port), None, &mut |p| progress.push(p))
        .await
        .unwrap();

    assert_eq!(rec.status, InstanceStatus::Running);
    assert_eq!(rec.port, port);
    assert_eq!(rec.version, "7.4.1");
    assert_eq!(progress.last(), Some(&100));

    let desc = &orch.list_binaries()[&Engine::Redis];
    assert!(desc.installed);
    assert!(!desc.is_system);
    assert_eq!(desc.version.as_deref(), Some("7.4.1"));
    assert_eq!(
        desc.path.as_deref(),
        Some(config.binaries_dir().join("redis-7.4.1/src/redis-server").as_path())
    );

    // Only the installed version remains in the provisioning root.
    let entries: Vec<String> = fs::read_dir(config.binaries_dir())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["redis-7.4.1"]);

    assert!(is_alive(rec.pid.unwrap()));
    assert!(orch.shutdown().await.is_clean());
}

#[tokio::test]
async fn test_missing_archive_is_provisioning_error() {
    let mut h = harness(&[]);
    let err = h
        .orch
        .create_instance(Engine::Mongo, None, Some("6.0.6"), &mut |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Provisioning { engine: Engine::Mongo, .. }));
    assert!(h.orch.list_instances().unwrap().is_empty());
    assert!(!h.orch.list_binaries()[&Engine::Mongo].installed);
}
