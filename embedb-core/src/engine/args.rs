//! Server argument vectors, auxiliary file locations and generated config files.

use std::path::{Path, PathBuf};

use super::Engine;

/// Loopback address every instance binds to.
pub const LOOPBACK: &str = "127.0.0.1";

/// Filesystem layout of one instance, derived from its id and stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    pub engine: Engine,
    pub port: u16,
    /// `<data-root>/<engine>@<port>/data`
    pub data_path: PathBuf,
    /// Directory for unix sockets; the system temp dir unless the record says otherwise.
    pub socket_dir: PathBuf,
}

impl InstanceLayout {
    pub fn new(engine: Engine, port: u16, data_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            port,
            data_path: data_path.into(),
            socket_dir: std::env::temp_dir(),
        }
    }

    pub fn with_socket_dir(mut self, socket_dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = socket_dir.into();
        self
    }

    /// Instance id, `<engine>@<port>`.
    pub fn id(&self) -> String {
        instance_id(self.engine, self.port)
    }

    pub fn args(&self) -> Vec<String> {
        (self.engine.profile().build_args)(self)
    }

    pub fn stale_files(&self) -> Vec<PathBuf> {
        (self.engine.profile().stale_files)(self)
    }

    fn data(&self) -> String {
        self.data_path.display().to_string()
    }

    fn in_data(&self, name: &str) -> String {
        self.data_path.join(name).display().to_string()
    }

    fn socket(&self, name: &str) -> PathBuf {
        self.socket_dir.join(name)
    }
}

/// Instance id for an engine and port.
pub fn instance_id(engine: Engine, port: u16) -> String {
    format!("{engine}@{port}")
}

/// Directory that holds everything belonging to one instance.
pub fn instance_dir(data_root: &Path, engine: Engine, port: u16) -> PathBuf {
    data_root.join(instance_id(engine, port))
}

pub(crate) fn mongo_args(l: &InstanceLayout) -> Vec<String> {
    vec![
        "--dbpath".into(),
        l.data(),
        "--port".into(),
        l.port.to_string(),
        "--logpath".into(),
        l.in_data("mongod.log"),
        "--logappend".into(),
        "--bind_ip".into(),
        LOOPBACK.into(),
        "--unixSocketPrefix".into(),
        l.socket_dir.display().to_string(),
    ]
}

pub(crate) fn mongo_stale_files(l: &InstanceLayout) -> Vec<PathBuf> {
    vec![l.socket(&format!("mongodb-{}.sock", l.port))]
}

pub(crate) fn postgres_args(l: &InstanceLayout) -> Vec<String> {
    vec![
        "-D".into(),
        l.data(),
        "-p".into(),
        l.port.to_string(),
        "-h".into(),
        LOOPBACK.into(),
        "-k".into(),
        l.socket_dir.display().to_string(),
    ]
}

pub(crate) fn postgres_stale_files(l: &InstanceLayout) -> Vec<PathBuf> {
    vec![
        l.socket(&format!(".s.PGSQL.{}", l.port)),
        l.socket(&format!(".s.PGSQL.{}.lock", l.port)),
    ]
}

pub(crate) fn mysql_args(l: &InstanceLayout) -> Vec<String> {
    let [socket, x_socket, pid_file] = mysql_aux(l);
    vec![
        format!("--datadir={}", l.data()),
        format!("--port={}", l.port),
        format!("--socket={}", socket.display()),
        format!("--pid-file={}", pid_file.display()),
        format!("--mysqlx-socket={}", x_socket.display()),
        format!("--bind-address={LOOPBACK}"),
    ]
}

pub(crate) fn mysql_stale_files(l: &InstanceLayout) -> Vec<PathBuf> {
    mysql_aux(l).to_vec()
}

fn mysql_aux(l: &InstanceLayout) -> [PathBuf; 3] {
    [
        l.socket(&format!("mysql_{}.sock", l.port)),
        l.socket(&format!("mysqlx_{}.sock", l.port)),
        l.data_path.join(format!("mysqld_{}.pid", l.port)),
    ]
}

pub(crate) fn redis_args(l: &InstanceLayout) -> Vec<String> {
    vec![l.in_data("redis.conf")]
}

pub(crate) fn redis_stale_files(_: &InstanceLayout) -> Vec<PathBuf> {
    Vec::new()
}

/// `redis.conf` written on first creation.
pub fn redis_config(l: &InstanceLayout) -> String {
    format!(
        "# Redis configuration\n\
         port {port}\n\
         bind {LOOPBACK}\n\
         dir \"{dir}\"\n\
         dbfilename dump.rdb\n\
         # Save the DB on disk\n\
         save 900 1\n\
         save 300 10\n\
         save 60 10000\n",
        port = l.port,
        dir = l.data(),
    )
}

/// Client authentication method written to `pg_hba.conf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HbaMethod {
    Trust,
    Md5,
}

impl HbaMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Trust => "trust",
            Self::Md5 => "md5",
        }
    }
}

/// `pg_hba.conf` granting local socket and loopback access with `method`.
pub fn pg_hba(method: HbaMethod) -> String {
    let m = method.as_str();
    format!(
        "# TYPE  DATABASE        USER            ADDRESS                 METHOD\n\
         local   all             all                                     {m}\n\
         host    all             all             127.0.0.1/32            {m}\n\
         host    all             all             ::1/128                 {m}\n"
    )
}
