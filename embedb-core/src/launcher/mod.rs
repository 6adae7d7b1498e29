//! Launcher - structured process spawning
//!
//! Every process the orchestrator starts (one-time init tools and long-running
//! engine servers alike) is described by a [`LaunchSpec`]: a program, an
//! argument vector and, optionally, the account to run as. A [`Launcher`]
//! turns the spec into a live `tokio::process::Child`.
//!
//! # Design:
//! - **No shell**: arguments are passed as a vector, so paths with spaces or
//!   quotes reach the program unchanged
//! - **Identity switch in the child**: setgid/setuid happen after fork and
//!   before exec; supplementary groups are cleared by the runtime
//! - **Own session**: children call `setsid()` so a terminal interrupt meant
//!   for the host reaches them only through the orchestrator's own shutdown
//! - **Swappable**: tests inject a launcher that runs stand-in commands

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::privilege::Account;

/// What to run, with which arguments, as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Account to switch to; `None` runs as the current identity.
    pub account: Option<Account>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            account: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn run_as(mut self, account: Account) -> Self {
        self.account = Some(account);
        self
    }

    /// Executable file name, for log prefixes.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Spawns and signals processes described by a [`LaunchSpec`].
///
/// Spawned children must have stdout and stderr piped so their output can be
/// captured into instance logs.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Child>;

    /// Deliver the graceful termination signal.
    fn terminate(&self, pid: u32) -> io::Result<()> {
        send_signal(pid, Signal::SIGTERM)
    }
}

/// Launcher backed by the real OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Child> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        if let Some(account) = &spec.account {
            debug!(user = %account.name, program = %spec.program.display(), "Spawning as user");
            cmd.uid(account.uid)
                .gid(account.gid)
                .env("HOME", &account.home)
                .env("USER", &account.name)
                .env("LOGNAME", &account.name);
        }

        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(io::Error::from)
            });
        }

        cmd.spawn()
    }
}

/// Send `signal` to `pid`. A process that no longer exists is not an error.
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Last `max_chars` characters of captured process output, for error messages.
pub(crate) fn output_tail(bytes: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Whether a process with this pid exists and we may signal it.
///
/// `EPERM` counts as dead: such a process belongs to someone else.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), None).is_ok()
}

/// Whether live process `pid` is one we started: its command line names
/// `marker` (an instance data path), or it runs `program`.
///
/// Reads `/proc`; where that is unavailable nothing matches.
pub fn process_matches(pid: u32, program: Option<&Path>, marker: &Path) -> bool {
    if !is_alive(pid) {
        return false;
    }
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));

    let marker = marker.to_string_lossy();
    if let Ok(raw) = fs::read(proc_dir.join("cmdline")) {
        let named = raw
            .split(|b| *b == 0)
            .any(|arg| String::from_utf8_lossy(arg).contains(&*marker));
        if named {
            return true;
        }
    }

    // Servers that rewrite their process title still run the same file.
    let Some(program) = program.and_then(|p| fs::canonicalize(p).ok()) else {
        return false;
    };
    fs::read_link(proc_dir.join("exe")).is_ok_and(|exe| exe == program)
}
