use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Child, ExitStatus},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    config::SupervisorConfig,
    supervisor::{StartedSession, Supervisor, SupervisorError},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStatus {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub exiting: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default)]
    pub ssh_local_port: u16,
}

/// One record from the control process's stdout log, either flat
/// (`{"running":true,"sshLocalPort":22}`) or with the fields under `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawLifecycleEvent")]
pub struct LifecycleEvent {
    /// Records without a timestamp are never filtered out.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub time: Option<OffsetDateTime>,
    #[serde(default)]
    pub status: LifecycleStatus,
}

impl LifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.running || self.status.exiting
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLifecycleEvent {
    #[serde(default, with = "time::serde::rfc3339::option")]
    time: Option<OffsetDateTime>,
    #[serde(default)]
    status: Option<LifecycleStatus>,
    running: Option<bool>,
    degraded: Option<bool>,
    exiting: Option<bool>,
    errors: Option<Vec<String>>,
    ssh_local_port: Option<u16>,
}

impl From<RawLifecycleEvent> for LifecycleEvent {
    fn from(raw: RawLifecycleEvent) -> Self {
        let flat = raw.running.is_some()
            || raw.degraded.is_some()
            || raw.exiting.is_some()
            || raw.errors.is_some()
            || raw.ssh_local_port.is_some();
        let status = match raw.status {
            Some(status) => status,
            None if flat => LifecycleStatus {
                running: raw.running.unwrap_or_default(),
                degraded: raw.degraded.unwrap_or_default(),
                exiting: raw.exiting.unwrap_or_default(),
                errors: raw.errors.unwrap_or_default(),
                ssh_local_port: raw.ssh_local_port.unwrap_or_default(),
            },
            None => {
                tracing::warn!("lifecycle record carries no known field");
                LifecycleStatus::default()
            }
        };
        Self {
            time: raw.time,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Exiting,
    Timeout,
    StreamEnded,
    UnexpectedExit,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Ready { ssh_local_port: u16 },
    Degraded { reason: String, ssh_local_port: u16 },
    Failed { kind: FailureKind, reason: String },
}

impl LifecycleOutcome {
    fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        LifecycleOutcome::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleOutcome::Ready { .. })
    }

    /// `Ok(ssh_local_port)` when ready.
    pub fn into_result(self) -> Result<u16, LifecycleError> {
        match self {
            LifecycleOutcome::Ready { ssh_local_port } => Ok(ssh_local_port),
            LifecycleOutcome::Degraded {
                reason,
                ssh_local_port,
            } => Err(LifecycleError::Degraded {
                reason,
                ssh_local_port,
            }),
            LifecycleOutcome::Failed {
                kind: FailureKind::UnexpectedExit,
                reason,
            } => Err(LifecycleError::UnexpectedExit { reason }),
            LifecycleOutcome::Failed { reason, .. } => Err(LifecycleError::Failed { reason }),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{reason}")]
    Degraded { reason: String, ssh_local_port: u16 },
    #[error("{reason}")]
    Failed { reason: String },
    #[error("{reason}")]
    UnexpectedExit { reason: String },
}

/// Folds lifecycle events into an outcome. Once terminal, further events are
/// ignored.
#[derive(Debug, Clone)]
pub struct LifecycleFold {
    stderr_log: PathBuf,
    ssh_local_port: Option<u16>,
    outcome: Option<LifecycleOutcome>,
}

impl LifecycleFold {
    pub fn new(stderr_log: impl Into<PathBuf>) -> Self {
        Self {
            stderr_log: stderr_log.into(),
            ssh_local_port: None,
            outcome: None,
        }
    }

    /// First non-zero SSH port seen.
    pub fn ssh_local_port(&self) -> Option<u16> {
        self.ssh_local_port
    }

    pub fn outcome(&self) -> Option<&LifecycleOutcome> {
        self.outcome.as_ref()
    }

    /// Returns the outcome on the event that produces it, `None` otherwise.
    pub fn apply(&mut self, event: &LifecycleEvent) -> Option<LifecycleOutcome> {
        if self.outcome.is_some() {
            return None;
        }
        let status = &event.status;
        if self.ssh_local_port.is_none() && status.ssh_local_port != 0 {
            tracing::info!(ssh_local_port = status.ssh_local_port, "SSH local port");
            self.ssh_local_port = Some(status.ssh_local_port);
        }
        if !status.errors.is_empty() {
            tracing::warn!(errors = ?status.errors, "control process reported errors");
        }

        let stderr = self.stderr_log.display();
        let outcome = if status.exiting {
            LifecycleOutcome::failed(
                FailureKind::Exiting,
                format!("control process is exiting; see {stderr}"),
            )
        } else if status.running {
            let ssh_local_port = match status.ssh_local_port {
                0 => self.ssh_local_port.unwrap_or(0),
                port => port,
            };
            if status.degraded {
                LifecycleOutcome::Degraded {
                    reason: format!("degraded, connectivity may not work; see {stderr}"),
                    ssh_local_port,
                }
            } else {
                LifecycleOutcome::Ready { ssh_local_port }
            }
        } else {
            return None;
        };
        self.outcome = Some(outcome.clone());
        Some(outcome)
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for WatchOptions {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.watch_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

enum TailRead {
    Lines(Vec<String>),
    Ended,
}

/// Follows a growing log file line by line.
struct LogTail {
    path: PathBuf,
    file: Option<File>,
    offset: u64,
    partial: Vec<u8>,
}

impl LogTail {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            offset: 0,
            partial: Vec::new(),
        }
    }

    fn read_lines(&mut self) -> io::Result<TailRead> {
        if self.file.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Ok(TailRead::Lines(Vec::new()));
                }
                Err(err) => return Err(err),
            }
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(TailRead::Lines(Vec::new()));
        };
        if !self.path.exists() || file.metadata()?.len() < self.offset {
            return Ok(TailRead::Ended);
        }

        let mut buf = Vec::new();
        let read = file.read_to_end(&mut buf)?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        Ok(TailRead::Lines(lines))
    }
}

fn forward_control_log(tail: &mut LogTail) {
    if let Ok(TailRead::Lines(lines)) = tail.read_lines() {
        for line in lines {
            tracing::info!("[control] {line}");
        }
    }
}

/// Follows `stdout_log` from its start until a terminal lifecycle event
/// newer than `since` shows up, `options.timeout` passes, the log ends or
/// `stop` is set. Lines appended to `stderr_log` meanwhile are forwarded to
/// the host log.
pub fn watch(
    session: &str,
    stdout_log: &Path,
    stderr_log: &Path,
    since: OffsetDateTime,
    options: &WatchOptions,
    stop: &AtomicBool,
) -> LifecycleOutcome {
    let deadline = Instant::now() + options.timeout;
    let mut events = LogTail::new(stdout_log);
    let mut control_log = LogTail::new(stderr_log);
    let mut fold = LifecycleFold::new(stderr_log);
    tracing::debug!(
        session,
        path = %stdout_log.display(),
        timeout_ms = options.timeout.as_millis() as u64,
        "watching lifecycle events"
    );

    loop {
        forward_control_log(&mut control_log);
        let lines = match events.read_lines() {
            Ok(TailRead::Lines(lines)) => lines,
            Ok(TailRead::Ended) => {
                return no_terminal_state(FailureKind::StreamEnded, "the event log ended", stderr_log);
            }
            Err(err) => {
                tracing::error!(path = %stdout_log.display(), error = %err, "failed to read event log");
                return no_terminal_state(FailureKind::StreamEnded, "the event log became unreadable", stderr_log);
            }
        };

        for line in lines {
            let event: LifecycleEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, line = %line, "skipping malformed lifecycle event");
                    continue;
                }
            };
            if event.time.is_some_and(|time| time < since) {
                continue;
            }
            tracing::debug!(session, status = ?event.status, "lifecycle event");
            if let Some(outcome) = fold.apply(&event) {
                forward_control_log(&mut control_log);
                tracing::info!(session, outcome = ?outcome, "lifecycle resolved");
                return outcome;
            }
        }

        if stop.load(Ordering::SeqCst) {
            return LifecycleOutcome::failed(FailureKind::Cancelled, "lifecycle watch cancelled");
        }
        let now = Instant::now();
        if now >= deadline {
            let waited = format!("{}ms passed", options.timeout.as_millis());
            return no_terminal_state(FailureKind::Timeout, &waited, stderr_log);
        }
        thread::sleep(options.poll_interval.min(deadline - now));
    }
}

fn no_terminal_state(kind: FailureKind, cause: &str, stderr_log: &Path) -> LifecycleOutcome {
    LifecycleOutcome::failed(
        kind,
        format!(
            "no terminal lifecycle state observed ({cause}); see {}",
            stderr_log.display()
        ),
    )
}

/// Result of [`race`].
#[derive(Debug)]
pub struct Resolution {
    pub outcome: LifecycleOutcome,
    /// Handle of the control process; still running unless `exit_status` is
    /// set. `None` only if the exit waiter panicked.
    pub child: Option<Child>,
    pub exit_status: Option<ExitStatus>,
}

enum RaceEvent {
    Watched(LifecycleOutcome),
    Exited(io::Result<ExitStatus>),
}

/// Runs [`watch`] against the control process exiting. The first to finish
/// decides; an exit always counts as failure. The loser is stopped and joined
/// before this returns.
pub fn race(started: StartedSession, options: &WatchOptions) -> Resolution {
    let StartedSession {
        name,
        paths,
        begin,
        mut child,
    } = started;
    let (tx, rx) = mpsc::channel();
    let watch_stop = Arc::new(AtomicBool::new(false));
    let exit_stop = Arc::new(AtomicBool::new(false));

    let watcher = {
        let tx = tx.clone();
        let stop = watch_stop.clone();
        let options = options.clone();
        let paths = paths.clone();
        thread::spawn(move || {
            let outcome = watch(&name, &paths.stdout_log, &paths.stderr_log, begin, &options, &stop);
            let _ = tx.send(RaceEvent::Watched(outcome));
        })
    };

    let exit_waiter = {
        let stop = exit_stop.clone();
        let poll_interval = options.poll_interval;
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let _ = tx.send(RaceEvent::Exited(Ok(status)));
                        break;
                    }
                    Ok(None) => thread::sleep(poll_interval),
                    Err(err) => {
                        let _ = tx.send(RaceEvent::Exited(Err(err)));
                        break;
                    }
                }
            }
            child
        })
    };

    let first = rx.recv();
    watch_stop.store(true, Ordering::SeqCst);
    exit_stop.store(true, Ordering::SeqCst);
    let _ = watcher.join();
    let child = exit_waiter.join().ok();

    let stderr = paths.stderr_log.display();
    match first {
        Ok(RaceEvent::Watched(outcome)) => Resolution {
            outcome,
            child,
            exit_status: None,
        },
        Ok(RaceEvent::Exited(Ok(status))) => {
            tracing::error!(status = %status, "control process exited during startup");
            Resolution {
                outcome: LifecycleOutcome::failed(
                    FailureKind::UnexpectedExit,
                    format!("control process exited unexpectedly during startup ({status}); see {stderr}"),
                ),
                child,
                exit_status: Some(status),
            }
        }
        Ok(RaceEvent::Exited(Err(err))) => Resolution {
            outcome: LifecycleOutcome::failed(
                FailureKind::UnexpectedExit,
                format!("failed to wait for control process: {err}; see {stderr}"),
            ),
            child,
            exit_status: None,
        },
        Err(_) => Resolution {
            outcome: LifecycleOutcome::failed(
                FailureKind::Cancelled,
                format!("lifecycle watch aborted; see {stderr}"),
            ),
            child,
            exit_status: None,
        },
    }
}

/// [`Supervisor::start`] followed by [`race`].
pub fn launch(
    supervisor: &Supervisor,
    name: &str,
    options: &WatchOptions,
) -> Result<Resolution, SupervisorError> {
    let started = supervisor.start(name)?;
    Ok(race(started, options))
}
