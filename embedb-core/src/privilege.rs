//! Privilege resolution for database server processes
//!
//! Database servers refuse to run as root, and they should not be allowed to.
//! When the orchestrator itself runs elevated, every engine process is started
//! as an unprivileged account instead, and the data directories it touches
//! are handed over to that account.
//!
//! # Security Model:
//! ```text
//! orchestrator:  UID 0 (root, e.g. launched through sudo)
//!                 ↓ setgid/setuid in the child, before exec
//! engine:        $SUDO_USER | postgres | mysql | nobody
//! ```
//!
//! The switch happens in the spawned child with a structured argument
//! vector; no shell ever sees the command line.

use nix::unistd::{chown, Gid, Uid, User};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{OrchestratorError, Result};
use crate::launcher::LaunchSpec;

/// Service accounts tried, in order, after `$SUDO_USER`.
pub const FALLBACK_ACCOUNTS: &[&str] = &["_postgres", "postgres", "_mysql", "mysql", "nobody"];

/// An OS account processes can run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl Account {
    /// The identity this process runs with.
    pub fn current() -> Self {
        let uid = nix::unistd::getuid();
        match User::from_uid(uid) {
            Ok(Some(user)) => user.into(),
            _ => Self {
                name: std::env::var("USER").unwrap_or_else(|_| uid.to_string()),
                uid: uid.as_raw(),
                gid: nix::unistd::getgid().as_raw(),
                home: std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default(),
            },
        }
    }

    /// Look up an account by name in the system user database.
    pub fn lookup(name: &str) -> Option<Self> {
        User::from_name(name).ok().flatten().map(Into::into)
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

impl From<User> for Account {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        }
    }
}

/// Pick the account engine processes run as.
///
/// Non-root callers run everything as themselves. Root walks `$SUDO_USER`
/// and then [`FALLBACK_ACCOUNTS`], taking the first that `lookup` finds.
pub fn resolve_user<F>(current: &Account, sudo_user: Option<&str>, lookup: F) -> Result<Account>
where
    F: Fn(&str) -> Option<Account>,
{
    if !current.is_root() {
        return Ok(current.clone());
    }

    info!("Running as root, looking for a non-root account for database processes");

    let candidates = sudo_user
        .filter(|name| !name.is_empty() && *name != "root")
        .into_iter()
        .chain(FALLBACK_ACCOUNTS.iter().copied());

    for name in candidates {
        match lookup(name) {
            Some(account) if !account.is_root() => {
                info!(user = %account.name, uid = account.uid, "Found unprivileged account");
                return Ok(account);
            }
            Some(_) => debug!(user = name, "Candidate maps to uid 0, skipping"),
            None => debug!(user = name, "Candidate account does not exist"),
        }
    }

    Err(OrchestratorError::Privilege(
        "Running as root but no suitable non-privileged user found. \
         Please run this application as a regular user, or create a dedicated database user."
            .to_string(),
    ))
}

/// Decides and applies the identity database processes run under.
#[derive(Debug, Clone)]
pub struct PrivilegeResolver {
    current: Account,
    target: Account,
}

impl PrivilegeResolver {
    /// Resolve against the live system user database.
    pub fn detect() -> Result<Self> {
        let current = Account::current();
        let sudo_user = std::env::var("SUDO_USER").ok();
        let target = resolve_user(&current, sudo_user.as_deref(), Account::lookup)?;
        info!(user = %target.name, "Database processes will run as this user");
        Ok(Self { current, target })
    }

    pub fn from_accounts(current: Account, target: Account) -> Self {
        Self { current, target }
    }

    pub fn current(&self) -> &Account {
        &self.current
    }

    pub fn target(&self) -> &Account {
        &self.target
    }

    /// Whether spawned processes have to switch identity.
    pub fn switches_user(&self) -> bool {
        self.current.uid != self.target.uid
    }

    /// Structured invocation of `program` as the target account.
    pub fn run_as<I, S>(&self, program: impl Into<PathBuf>, args: I) -> LaunchSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = LaunchSpec::new(program).args(args);
        if self.switches_user() {
            spec.run_as(self.target.clone())
        } else {
            spec
        }
    }

    /// Hand `path` and everything below it to the target account, owner-only.
    ///
    /// Only acts when running as root for a different account. Failures are
    /// logged and counted, never returned.
    pub fn fix_ownership(&self, path: &Path) -> usize {
        if !self.current.is_root() || !self.switches_user() {
            return 0;
        }

        debug!(path = %path.display(), user = %self.target.name, "Fixing ownership");
        let uid = Uid::from_raw(self.target.uid);
        let gid = Gid::from_raw(self.target.gid);
        let mut failures = 0;

        for entry in WalkDir::new(path) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not walk directory");
                    failures += 1;
                    continue;
                }
            };
            if entry.path_is_symlink() {
                continue;
            }
            if let Err(e) = chown(entry.path(), Some(uid), Some(gid)) {
                warn!(path = %entry.path().display(), error = %e, "Could not change owner");
                failures += 1;
                continue;
            }
            if let Err(e) = restrict_to_owner(entry.path(), entry.file_type().is_dir()) {
                warn!(path = %entry.path().display(), error = %e, "Could not restrict permissions");
                failures += 1;
            }
        }

        failures
    }
}

fn restrict_to_owner(path: &Path, is_dir: bool) -> std::io::Result<()> {
    let mode = if is_dir {
        0o700
    } else {
        fs::metadata(path)?.permissions().mode() & 0o700
    };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}
