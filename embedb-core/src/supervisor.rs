//! Process supervisor - live engine processes and their exit reconciliation
//!
//! Each spawned process is owned by one supervising tokio task. The task
//! waits for the process to exit (or for a stop request), and reports what
//! happened as a [`SupervisorEvent`] over an unbounded channel. Output lines
//! are forwarded the same way. Nothing here touches the registry: the
//! orchestrator applies events in one place.
//!
//! # Termination Protocol:
//! ```text
//! stop(id, grace) ──▶ SIGTERM
//!                      ├─ exited within grace ──▶ Exited
//!                      └─ still running ───────▶ SIGKILL ──▶ Exited
//! ```

use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::launcher::{LaunchSpec, Launcher};

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Something that happened to a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// One line of output, without its trailing newline.
    Output {
        id: String,
        pid: u32,
        stream: OutputStream,
        line: String,
    },
    /// The process is gone.
    Exited {
        id: String,
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Waiting on the process failed at the OS level.
    Failed { id: String, pid: u32, error: String },
}

impl SupervisorEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Output { id, .. } | Self::Exited { id, .. } | Self::Failed { id, .. } => id,
        }
    }
}

struct LiveProcess {
    pid: u32,
    stop_tx: oneshot::Sender<Duration>,
    task: JoinHandle<()>,
}

/// In-memory table of live process handles, keyed by instance id.
pub struct ProcessSupervisor {
    launcher: Arc<dyn Launcher>,
    live: HashMap<String, LiveProcess>,
    /// Supervising tasks of processes that were asked to stop.
    draining: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ProcessSupervisor {
    /// Create a supervisor and the receiving end of its event channel.
    pub fn new(launcher: Arc<dyn Launcher>) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            launcher,
            live: HashMap::new(),
            draining: Vec::new(),
            events,
        };
        (supervisor, rx)
    }

    pub fn launcher(&self) -> &Arc<dyn Launcher> {
        &self.launcher
    }

    /// Spawn `spec` and track it under `id`. Returns the pid.
    pub fn spawn(&mut self, id: &str, spec: &LaunchSpec) -> io::Result<u32> {
        let mut child = self.launcher.launch(spec)?;
        let Some(pid) = child.id() else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited before it could be tracked", spec.program_name()),
            ));
        };

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_lines(id.to_string(), pid, OutputStream::Stdout, out, self.events.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(id.to_string(), pid, OutputStream::Stderr, err, self.events.clone()));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(id.to_string(), pid, child, stop_rx, self.events.clone()));

        info!(id = %id, pid, program = %spec.program_name(), "Process started");
        if let Some(previous) = self.live.insert(id.to_string(), LiveProcess { pid, stop_tx, task }) {
            warn!(id = %id, pid = previous.pid, "Replaced a handle that was still tracked");
            self.draining.push(previous.task);
        }
        Ok(pid)
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.live.get(id).map(|p| p.pid)
    }

    pub fn tracked(&self) -> Vec<String> {
        self.live.keys().cloned().collect()
    }

    /// Begin stopping `id`: SIGTERM now, SIGKILL once `grace` has passed.
    ///
    /// Returns `Ok(false)` when nothing is tracked under `id`. If the
    /// graceful signal cannot be delivered the handle stays tracked.
    pub fn stop(&mut self, id: &str, grace: Duration) -> io::Result<bool> {
        let Some(pid) = self.pid(id) else {
            return Ok(false);
        };

        debug!(id = %id, pid, "Sending SIGTERM");
        self.launcher.terminate(pid)?;

        if let Some(live) = self.live.remove(id) {
            // A closed channel means the process already exited on its own.
            let _ = live.stop_tx.send(grace);
            self.draining.push(live.task);
        }
        Ok(true)
    }

    /// Stop every tracked process, continuing past failures.
    pub fn stop_all(&mut self, grace: Duration) -> Vec<(String, io::Error)> {
        let mut failures = Vec::new();
        for id in self.tracked() {
            if let Err(e) = self.stop(&id, grace) {
                warn!(id = %id, error = %e, "Could not stop process");
                failures.push((id, e));
            }
        }
        failures
    }

    /// Drop the handle for `id` if it still belongs to `pid`.
    pub fn forget(&mut self, id: &str, pid: u32) -> bool {
        if self.pid(id) != Some(pid) {
            return false;
        }
        self.live.remove(id).is_some()
    }

    /// Wait until every process asked to stop has actually exited.
    ///
    /// Bounded by the grace period each was stopped with, since the forced
    /// kill follows it.
    pub async fn drain(&mut self) {
        for task in self.draining.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Supervising task ended abnormally");
            }
        }
    }
}

async fn supervise(
    id: String,
    pid: u32,
    mut child: Child,
    mut stop_rx: oneshot::Receiver<Duration>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let waited = tokio::select! {
        status = child.wait() => status,
        Ok(grace) = &mut stop_rx => terminate_within(&id, pid, &mut child, grace).await,
    };

    let event = match waited {
        Ok(status) => {
            info!(id = %id, pid, status = %status, "Process exited");
            exited(id, pid, status)
        }
        Err(e) => {
            warn!(id = %id, pid, error = %e, "Waiting on process failed");
            SupervisorEvent::Failed {
                id,
                pid,
                error: e.to_string(),
            }
        }
    };
    let _ = events.send(event);
}

async fn terminate_within(id: &str, pid: u32, child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(id = %id, pid, grace_ms = grace.as_millis() as u64, "Grace period elapsed, sending SIGKILL");
            child.kill().await?;
            child.wait().await
        }
    }
}

fn exited(id: String, pid: u32, status: ExitStatus) -> SupervisorEvent {
    SupervisorEvent::Exited {
        id,
        pid,
        code: status.code(),
        signal: status.signal(),
    }
}

async fn forward_lines<R>(
    id: String,
    pid: u32,
    stream: OutputStream,
    pipe: R,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r']).to_string();
                let event = SupervisorEvent::Output {
                    id: id.clone(),
                    pid,
                    stream,
                    line,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(id = %id, pid, error = %e, "Output pipe closed with error");
                break;
            }
        }
    }
}
