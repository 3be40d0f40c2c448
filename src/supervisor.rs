use std::{
    fs, io,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    config::SupervisorConfig,
    session::{SessionError, SessionPaths, SessionStore},
};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(
        "session already running: {} exists (remove it if the session is known to be dead)",
        .pidfile.display()
    )]
    AlreadyRunning { pidfile: PathBuf },
    #[error(
        "control process did not write {} within {}ms; see {}",
        .pidfile.display(),
        .timeout.as_millis(),
        .stderr_log.display()
    )]
    StartupTimeout {
        pidfile: PathBuf,
        stderr_log: PathBuf,
        timeout: Duration,
    },
    #[error(
        "control process exited ({status}) before writing {}; see {}",
        .pidfile.display(),
        .stderr_log.display()
    )]
    ExitedBeforeReady {
        status: ExitStatus,
        pidfile: PathBuf,
        stderr_log: PathBuf,
    },
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub control_program: PathBuf,
    pub control_args: Vec<String>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for SupervisorOptions {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            control_program: PathBuf::from(&config.control_program),
            control_args: config.control_args.clone(),
            startup_timeout: Duration::from_millis(config.startup_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// A control process that finished its own initialization.
#[derive(Debug)]
pub struct StartedSession {
    pub name: String,
    pub paths: SessionPaths,
    /// Taken just before the spawn; earlier log records are not ours.
    pub begin: OffsetDateTime,
    pub child: Child,
}

/// Launches the host-side control process for a session.
#[derive(Debug, Clone)]
pub struct Supervisor {
    store: SessionStore,
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(store: SessionStore, options: SupervisorOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Spawns `<program> <args...> --pidfile <pidfile> <name>` with fresh
    /// stdout/stderr logs and waits for the pidfile to show up.
    pub fn start(&self, name: &str) -> Result<StartedSession, SupervisorError> {
        let paths = self.store.ensure_paths(name)?;
        if paths.pidfile.exists() {
            return Err(SupervisorError::AlreadyRunning {
                pidfile: paths.pidfile,
            });
        }

        let stdout = truncate_log(&paths.stdout_log)?;
        let stderr = truncate_log(&paths.stderr_log)?;

        let mut cmd = Command::new(&self.options.control_program);
        cmd.args(&self.options.control_args)
            .arg("--pidfile")
            .arg(&paths.pidfile)
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let begin = OffsetDateTime::now_utc();
        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.options.control_program.clone(),
            source,
        })?;
        tracing::info!(
            session = name,
            pid = child.id(),
            program = %self.options.control_program.display(),
            stdout = %paths.stdout_log.display(),
            stderr = %paths.stderr_log.display(),
            "control process spawned"
        );

        if let Err(err) = self.wait_for_pidfile(&paths, &mut child) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }
        tracing::info!(session = name, pidfile = %paths.pidfile.display(), "control process initialized");

        Ok(StartedSession {
            name: name.to_string(),
            paths,
            begin,
            child,
        })
    }

    fn wait_for_pidfile(
        &self,
        paths: &SessionPaths,
        child: &mut Child,
    ) -> Result<(), SupervisorError> {
        let timeout = self.options.startup_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if paths.pidfile.exists() {
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                tracing::error!(status = %status, "control process exited before writing its pidfile");
                return Err(SupervisorError::ExitedBeforeReady {
                    status,
                    pidfile: paths.pidfile.clone(),
                    stderr_log: paths.stderr_log.clone(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::error!(
                    pidfile = %paths.pidfile.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "control process startup timed out"
                );
                return Err(SupervisorError::StartupTimeout {
                    pidfile: paths.pidfile.clone(),
                    stderr_log: paths.stderr_log.clone(),
                    timeout,
                });
            }
            tracing::trace!(pidfile = %paths.pidfile.display(), "waiting for pidfile");
            thread::sleep(self.options.poll_interval.min(deadline - now));
        }
    }
}

fn truncate_log(path: &std::path::Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}
