//! Engine module - the four supported database engines
//!
//! Every per-engine difference (where the executable lives, how the data
//! directory is initialized, which arguments the server takes, what a client
//! needs to connect) is captured in one [`EngineProfile`] entry. The rest of
//! the orchestrator asks the profile instead of branching on the engine.
//!
//! # Profile Table:
//! ```text
//! Engine    Executable           Init step                Marker
//! mongo     bin/mongod           none                     -
//! postgres  bin/postgres         initdb --auth=trust      PG_VERSION
//! mysql     bin/mysqld           --initialize-insecure    mysql/
//! redis     src/redis-server     write redis.conf         redis.conf
//! ```

pub mod args;
pub mod connection;
pub mod download;

pub use args::InstanceLayout;
pub use connection::ConnectionInfo;
pub use download::DownloadSpec;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A database engine that can be provisioned and run locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Document store.
    Mongo,
    /// Relational engine with a separate `initdb` tool and host-based auth file.
    Postgres,
    /// Relational engine initialized by the server binary itself.
    Mysql,
    /// Key-value store, built from source.
    Redis,
}

impl Engine {
    pub const ALL: [Engine; 4] = [Engine::Mongo, Engine::Postgres, Engine::Mysql, Engine::Redis];

    /// Short lowercase name, used in instance ids and provisioned directory names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mongo => "mongo",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Redis => "redis",
        }
    }

    /// Declarative behavior for this engine.
    pub fn profile(self) -> &'static EngineProfile {
        match self {
            Self::Mongo => &PROFILES[0],
            Self::Postgres => &PROFILES[1],
            Self::Mysql => &PROFILES[2],
            Self::Redis => &PROFILES[3],
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(Self::Mongo),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "redis" => Ok(Self::Redis),
            other => Err(format!(
                "unsupported engine '{other}' (expected mongo, postgres, mysql or redis)"
            )),
        }
    }
}

/// One-time data directory setup performed before the first start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    /// The server creates its files on first start.
    None,
    /// Run the sibling `initdb` tool with trust auth, then write `pg_hba.conf`.
    InitDb,
    /// Run the server binary with `--initialize-insecure`.
    InitializeInsecure,
    /// Write a configuration file into the data directory.
    WriteConfig,
}

/// Declarative per-engine strategy.
///
/// Function pointers keep the table `static` while letting each engine
/// compute paths from its [`InstanceLayout`].
pub struct EngineProfile {
    pub engine: Engine,
    /// Executable path relative to a provisioned `<engine>-<version>` directory.
    pub executable: &'static str,
    /// Well-known system install locations, checked before provisioned ones.
    pub system_paths: &'static [&'static str],
    /// Version provisioned when the caller asks for none (or `latest`).
    pub default_version: &'static str,
    /// Database superuser name reported in connection info and the record.
    pub default_username: Option<&'static str>,
    pub init: InitStep,
    /// File or directory inside the data directory whose presence means
    /// initialization already happened.
    pub init_marker: Option<&'static str>,
    /// The download is a source tarball that has to be built with `make`.
    pub compile: bool,
    /// The record persists a socket directory for this engine.
    pub persists_socket_dir: bool,
    pub build_args: fn(&InstanceLayout) -> Vec<String>,
    pub stale_files: fn(&InstanceLayout) -> Vec<PathBuf>,
    pub connection_info: fn(u16, bool) -> ConnectionInfo,
}

impl EngineProfile {
    /// Absolute path of the init marker for the given data directory.
    pub fn marker_path(&self, layout: &InstanceLayout) -> Option<PathBuf> {
        self.init_marker.map(|m| layout.data_path.join(m))
    }

    /// Canonical directory name for a provisioned version.
    pub fn versioned_dir_name(&self, version: &str) -> String {
        format!("{}-{}", self.engine, version)
    }
}

impl fmt::Debug for EngineProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineProfile")
            .field("engine", &self.engine)
            .field("executable", &self.executable)
            .field("default_version", &self.default_version)
            .field("init", &self.init)
            .field("compile", &self.compile)
            .finish()
    }
}

static PROFILES: [EngineProfile; 4] = [
    EngineProfile {
        engine: Engine::Mongo,
        executable: "bin/mongod",
        system_paths: &[
            "/usr/bin/mongod",
            "/usr/local/bin/mongod",
            "/opt/homebrew/bin/mongod",
        ],
        default_version: "6.0.6",
        default_username: None,
        init: InitStep::None,
        init_marker: None,
        compile: false,
        persists_socket_dir: false,
        build_args: args::mongo_args,
        stale_files: args::mongo_stale_files,
        connection_info: connection::mongo_info,
    },
    EngineProfile {
        engine: Engine::Postgres,
        executable: "bin/postgres",
        system_paths: &[
            "/usr/local/bin/postgres",
            "/opt/homebrew/bin/postgres",
            "/usr/bin/postgres",
        ],
        default_version: "17.2.0",
        default_username: Some("postgres"),
        init: InitStep::InitDb,
        init_marker: Some("PG_VERSION"),
        compile: false,
        persists_socket_dir: true,
        build_args: args::postgres_args,
        stale_files: args::postgres_stale_files,
        connection_info: connection::postgres_info,
    },
    EngineProfile {
        engine: Engine::Mysql,
        executable: "bin/mysqld",
        system_paths: &[
            "/usr/sbin/mysqld",
            "/usr/local/bin/mysqld",
            "/opt/homebrew/bin/mysqld",
        ],
        default_version: "9.5.0",
        default_username: Some("root"),
        init: InitStep::InitializeInsecure,
        init_marker: Some("mysql"),
        compile: false,
        persists_socket_dir: false,
        build_args: args::mysql_args,
        stale_files: args::mysql_stale_files,
        connection_info: connection::mysql_info,
    },
    EngineProfile {
        engine: Engine::Redis,
        executable: "src/redis-server",
        system_paths: &[
            "/usr/bin/redis-server",
            "/usr/local/bin/redis-server",
            "/opt/homebrew/bin/redis-server",
        ],
        default_version: "7.4.1",
        default_username: None,
        init: InitStep::WriteConfig,
        init_marker: Some("redis.conf"),
        compile: true,
        persists_socket_dir: false,
        build_args: args::redis_args,
        stale_files: args::redis_stale_files,
        connection_info: connection::redis_info,
    },
];
