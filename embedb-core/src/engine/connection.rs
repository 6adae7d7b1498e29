//! Connection details handed to the query layer.
//!
//! These builders never touch the filesystem or the process table: the output
//! depends only on engine, port and whether password auth has been enabled.

use serde::{Deserialize, Serialize};

use super::args::LOOPBACK;
use super::Engine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub connection_string: String,
    pub username: Option<String>,
    /// Hint only; actual passwords are never stored.
    pub password: Option<String>,
    pub database: String,
    pub note: Option<String>,
}

const PASSWORD_REQUIRED: &str = "(password required)";

fn base(engine: Engine, port: u16, connection_string: String, database: &str) -> ConnectionInfo {
    ConnectionInfo {
        engine,
        host: LOOPBACK.to_string(),
        port,
        connection_string,
        username: None,
        password: None,
        database: database.to_string(),
        note: None,
    }
}

fn password_hint(password_set: bool) -> Option<String> {
    password_set.then(|| PASSWORD_REQUIRED.to_string())
}

pub(crate) fn mongo_info(port: u16, _password_set: bool) -> ConnectionInfo {
    base(
        Engine::Mongo,
        port,
        format!("mongodb://{LOOPBACK}:{port}"),
        "admin",
    )
}

pub(crate) fn postgres_info(port: u16, password_set: bool) -> ConnectionInfo {
    let mut info = base(
        Engine::Postgres,
        port,
        format!("postgresql://postgres@{LOOPBACK}:{port}/postgres"),
        "postgres",
    );
    info.username = Some("postgres".into());
    info.password = password_hint(password_set);
    info.note = Some(if password_set {
        format!(
            "Password authentication is enabled. Connect with: \
             psql \"postgresql://postgres:yourpassword@{LOOPBACK}:{port}/postgres\""
        )
    } else {
        format!(
            "No password required initially. Connect with: \
             psql \"postgresql://postgres@{LOOPBACK}:{port}/postgres\" \
             then set password with: ALTER ROLE postgres WITH PASSWORD 'yourpassword';"
        )
    });
    info
}

pub(crate) fn mysql_info(port: u16, password_set: bool) -> ConnectionInfo {
    let mut info = base(
        Engine::Mysql,
        port,
        format!("mysql://root@{LOOPBACK}:{port}"),
        "mysql",
    );
    info.username = Some("root".into());
    info.password = password_hint(password_set);
    info.note = Some(if password_set {
        format!(
            "Password authentication is enabled. Connect with: \
             mysql -u root -p -h {LOOPBACK} -P {port}"
        )
    } else {
        format!(
            "No password required initially. Connect with: \
             mysql -u root -h {LOOPBACK} -P {port} \
             then set password with: ALTER USER 'root'@'localhost' IDENTIFIED BY 'yourpassword'; \
             FLUSH PRIVILEGES;"
        )
    });
    info
}

pub(crate) fn redis_info(port: u16, _password_set: bool) -> ConnectionInfo {
    let mut info = base(
        Engine::Redis,
        port,
        format!("redis://{LOOPBACK}:{port}"),
        "0",
    );
    info.note = Some(format!("Connect with: redis-cli -h {LOOPBACK} -p {port}"));
    info
}
