//! embedb - run local database engines for development
//!
//! A thin command-line front end over [`Orchestrator`]. Commands that leave an
//! instance running stay in the foreground, streaming its output, until
//! Ctrl-C; every instance this process started is then shut down.

use anyhow::{bail, Context, Result};
use embedb_core::{init, Engine, Orchestrator, OrchestratorConfig, SupervisorEvent};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

fn print_help() {
    println!("embedb - Embedded Database Instance Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  embedb [OPTIONS] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("  binaries                                  Show installed engine binaries");
    println!("  list                                      List instances");
    println!("  create <engine> [--port N] [--version V]  Provision, initialize and run an instance");
    println!("  start <id>                                Start a stopped instance");
    println!("  stop <id>                                 Stop a running instance");
    println!("  delete <id>                               Stop and remove an instance and its data");
    println!("  info <id>                                 Print connection details");
    println!("  logs <id>                                 Print captured server output");
    println!("  enable-password <id>                      Require password authentication");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config <FILE>  Load settings from a JSON file");
    println!("  -h, --help           Print this help message");
    println!("  -v, --version        Print version information");
    println!();
    println!("ENGINES:");
    println!("  mongo, postgres, mysql, redis");
    println!();
    println!("ENVIRONMENT:");
    println!("  EMBEDB_DATA_DIR, EMBEDB_GRACE_PERIOD_MS, EMBEDB_SYSTEM_BINARIES,");
    println!("  EMBEDB_MAX_LOG_BYTES, EMBEDB_ARCHIVE_MIRROR, RUST_LOG");
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Binaries,
    List,
    Create {
        engine: Engine,
        port: Option<u16>,
        version: Option<String>,
    },
    Start(String),
    Stop(String),
    Delete(String),
    Info(String),
    Logs(String),
    EnablePassword(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Help,
    Version,
    Run {
        config: Option<PathBuf>,
        command: Command,
    },
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut port = None;
    let mut version = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            // After `create`, --version names the engine version.
            "--version" if positional.first().is_some_and(|c| c == "create") => {
                let v = iter.next().context("--version needs a value")?;
                version = Some(v.clone());
            }
            "-v" | "--version" => return Ok(Invocation::Version),
            "-c" | "--config" => {
                let path = iter.next().context("--config needs a file path")?;
                config = Some(PathBuf::from(path));
            }
            "--port" => {
                let raw = iter.next().context("--port needs a number")?;
                port = Some(raw.parse::<u16>().with_context(|| format!("invalid port '{raw}'"))?);
            }
            other if other.starts_with('-') => bail!("unrecognized argument '{other}'"),
            other => positional.push(other.to_string()),
        }
    }

    let mut positional = positional.into_iter();
    let Some(name) = positional.next() else {
        bail!("no command given");
    };
    let mut id = || positional.next().with_context(|| format!("'{name}' needs an instance id"));

    let command = match name.as_str() {
        "binaries" => Command::Binaries,
        "list" => Command::List,
        "create" => {
            let engine = id()
                .context("'create' needs an engine")?
                .parse::<Engine>()
                .map_err(anyhow::Error::msg)?;
            Command::Create { engine, port, version }
        }
        "start" => Command::Start(id()?),
        "stop" => Command::Stop(id()?),
        "delete" => Command::Delete(id()?),
        "info" => Command::Info(id()?),
        "logs" => Command::Logs(id()?),
        "enable-password" => Command::EnablePassword(id()?),
        other => bail!("unknown command '{other}'"),
    };
    if let Some(extra) = positional.next() {
        bail!("unexpected argument '{extra}'");
    }
    Ok(Invocation::Run { config, command })
}

fn load_config(path: Option<PathBuf>) -> Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::from_file(&path)?,
        None => OrchestratorConfig::from_env()?,
    };
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Stream output of `id` until it exits or Ctrl-C, then shut everything down.
async fn run_foreground(orchestrator: &mut Orchestrator, id: &str) -> Result<()> {
    info!(id, "Running in the foreground, press Ctrl-C to stop");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("listening for Ctrl-C")?;
                println!();
                break;
            }
            event = orchestrator.next_event() => match event? {
                Some(SupervisorEvent::Output { id: source, line, .. }) => println!("[{source}] {line}"),
                Some(SupervisorEvent::Exited { id: source, .. }) if source == id => {
                    warn!(id, "Instance exited");
                    break;
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    let report = orchestrator.shutdown().await;
    for (id, reason) in &report.failed {
        eprintln!("error: could not stop {id}: {reason}");
    }
    if !report.is_clean() {
        bail!("{} instance(s) could not be stopped", report.failed.len());
    }
    Ok(())
}

async fn run(config: OrchestratorConfig, command: Command) -> Result<()> {
    let mut orchestrator = Orchestrator::new(config).context("starting orchestrator")?;

    match command {
        Command::Binaries => print_json(orchestrator.list_binaries())?,
        Command::List => {
            let records = orchestrator.list_instances()?;
            if records.is_empty() {
                println!("No instances.");
            }
            for rec in records {
                let pid = rec.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                println!("{:<20} {:<8} {:<8} {}", rec.id, format!("{:?}", rec.status).to_lowercase(), pid, rec.version);
            }
        }
        Command::Create { engine, port, version } => {
            let mut progress = |percent: u8| {
                eprint!("\rDownloading {engine}: {percent:>3}%");
                let _ = std::io::stderr().flush();
                if percent == 100 {
                    eprintln!();
                }
            };
            let record = orchestrator
                .create_instance(engine, port, version.as_deref(), &mut progress)
                .await?;
            print_json(&orchestrator.connection_info(&record.id)?)?;
            run_foreground(&mut orchestrator, &record.id).await?;
        }
        Command::Start(id) => {
            orchestrator.start_instance(&id)?;
            run_foreground(&mut orchestrator, &id).await?;
        }
        Command::Stop(id) => print_json(&orchestrator.stop_instance(&id)?)?,
        Command::Delete(id) => {
            let removed = orchestrator.delete_instance(&id)?;
            println!("Deleted {} ({})", removed.id, removed.data_path.display());
        }
        Command::Info(id) => print_json(&orchestrator.connection_info(&id)?)?,
        Command::Logs(id) => print!("{}", orchestrator.instance_logs(&id)?),
        Command::EnablePassword(id) => {
            let record = orchestrator.set_password_enabled(&id)?;
            print_json(&orchestrator.connection_info(&record.id)?)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let (config, command) = match parse_args(&args) {
        Ok(Invocation::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Invocation::Version) => {
            println!("embedb {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Ok(Invocation::Run { config, command }) => (config, command),
        Err(e) => {
            eprintln!("error: {e:#}");
            eprintln!("Run 'embedb --help' for usage information.");
            std::process::exit(1);
        }
    };

    init()?;
    run(load_config(config)?, command).await
}
