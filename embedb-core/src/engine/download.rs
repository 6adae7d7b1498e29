//! Download locations for engine archives.

use super::Engine;

/// Where to fetch an engine archive and what it unpacks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub url: String,
    /// File extension of the archive (`tgz`, `tar.gz`, `tar.xz`).
    pub extension: &'static str,
    /// Top-level folder the archive is expected to contain.
    pub extracted_dir: String,
}

impl DownloadSpec {
    /// Spec for the host this process runs on.
    pub fn for_host(engine: Engine, version: &str) -> Result<Self, String> {
        Self::for_platform(engine, version, std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn for_platform(engine: Engine, version: &str, os: &str, arch: &str) -> Result<Self, String> {
        let unsupported = || format!("no {engine} {version} download for {os}/{arch}");

        let spec = match (engine, os) {
            (Engine::Mongo, "macos") => {
                let a = match arch {
                    "x86_64" => "x86_64",
                    "aarch64" => "arm64",
                    _ => return Err(unsupported()),
                };
                let dir = format!("mongodb-macos-{a}-{version}");
                Self {
                    url: format!("https://fastdl.mongodb.org/osx/{dir}.tgz"),
                    extension: "tgz",
                    extracted_dir: dir,
                }
            }
            (Engine::Mongo, "linux") => {
                let a = linux_arch(arch).ok_or_else(unsupported)?;
                let dir = format!("mongodb-linux-{a}-ubuntu2204-{version}");
                Self {
                    url: format!("https://fastdl.mongodb.org/linux/{dir}.tgz"),
                    extension: "tgz",
                    extracted_dir: dir,
                }
            }
            (Engine::Postgres, "macos" | "linux") => {
                let a = linux_arch(arch).ok_or_else(unsupported)?;
                let triple = if os == "macos" { "apple-darwin" } else { "unknown-linux-gnu" };
                let dir = format!("postgresql-{version}-{a}-{triple}");
                Self {
                    url: format!(
                        "https://github.com/theseus-rs/postgresql-binaries/releases/download/{version}/{dir}.tar.gz"
                    ),
                    extension: "tar.gz",
                    extracted_dir: dir,
                }
            }
            (Engine::Mysql, "macos" | "linux") => {
                let series = major_minor(version).ok_or_else(unsupported)?;
                let (dir, extension) = if os == "macos" {
                    let a = match arch {
                        "x86_64" => "x86_64",
                        "aarch64" => "arm64",
                        _ => return Err(unsupported()),
                    };
                    (format!("mysql-{version}-macos15-{a}"), "tar.gz")
                } else {
                    let a = linux_arch(arch).ok_or_else(unsupported)?;
                    (format!("mysql-{version}-linux-glibc2.28-{a}"), "tar.xz")
                };
                Self {
                    url: format!("https://dev.mysql.com/get/Downloads/MySQL-{series}/{dir}.{extension}"),
                    extension,
                    extracted_dir: dir,
                }
            }
            (Engine::Redis, "macos" | "linux") => Self {
                url: format!("https://download.redis.io/releases/redis-{version}.tar.gz"),
                extension: "tar.gz",
                extracted_dir: format!("redis-{version}"),
            },
            _ => return Err(unsupported()),
        };
        Ok(spec)
    }

    /// Name of the temporary archive file inside the provisioning root.
    pub fn archive_name(&self, engine: Engine, version: &str) -> String {
        format!(".download-{engine}-{version}.{}", self.extension)
    }
}

fn linux_arch(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("x86_64"),
        "aarch64" => Some("aarch64"),
        _ => None,
    }
}

fn major_minor(version: &str) -> Option<String> {
    let mut parts = version.split('.');
    let major = parts.next().filter(|p| !p.is_empty())?;
    let minor = parts.next()?;
    Some(format!("{major}.{minor}"))
}
