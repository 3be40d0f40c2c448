use std::{
    env, fs,
    path::{Path, PathBuf},
};

use time::OffsetDateTime;

pub const HOME_ENV: &str = "VMPULSE_HOME";
pub const GLOBAL_DIR_NAME: &str = ".vmpulse";
pub const PIDFILE_NAME: &str = "ha.pid";
pub const STDOUT_LOG_NAME: &str = "ha.stdout.log";
pub const STDERR_LOG_NAME: &str = "ha.stderr.log";
pub const AGENT_SOCKET_NAME: &str = "ga.sock";
pub const CLI_LOG_NAME: &str = "cli.log";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("HOME environment variable is not set")]
    MissingHome,
    #[error("Invalid session name: {0:?}")]
    InvalidName(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Files belonging to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub pidfile: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub agent_socket: PathBuf,
    pub cli_log: PathBuf,
}

impl SessionPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            pidfile: dir.join(PIDFILE_NAME),
            stdout_log: dir.join(STDOUT_LOG_NAME),
            stderr_log: dir.join(STDERR_LOG_NAME),
            agent_socket: dir.join(AGENT_SOCKET_NAME),
            cli_log: dir.join(CLI_LOG_NAME),
            dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub name: String,
    pub directory: PathBuf,
    /// Whether the pidfile exists.
    pub marker_present: bool,
    pub pid: Option<u32>,
    pub last_active: Option<OffsetDateTime>,
}

/// Session directories under one root, `$VMPULSE_HOME` or `~/.vmpulse`.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new() -> Result<Self, SessionError> {
        if let Some(root) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }
        let home = env::var_os("HOME").ok_or(SessionError::MissingHome)?;
        Ok(Self::with_root(PathBuf::from(home).join(GLOBAL_DIR_NAME)))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, name: &str) -> Result<PathBuf, SessionError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    pub fn paths(&self, name: &str) -> Result<SessionPaths, SessionError> {
        Ok(SessionPaths::new(self.session_dir(name)?))
    }

    /// Like [`SessionStore::paths`] but creates the directory.
    pub fn ensure_paths(&self, name: &str) -> Result<SessionPaths, SessionError> {
        let paths = self.paths(name)?;
        fs::create_dir_all(&paths.dir)?;
        Ok(paths)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, SessionError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if validate_name(&name).is_err() {
                continue;
            }
            let paths = SessionPaths::new(entry.path());
            let marker_present = paths.pidfile.exists();
            let pid = fs::read_to_string(&paths.pidfile)
                .ok()
                .and_then(|content| content.trim().parse::<u32>().ok());
            let last_active = fs::metadata(&paths.stdout_log)
                .and_then(|meta| meta.modified())
                .ok()
                .map(OffsetDateTime::from);
            sessions.push(SessionRecord {
                name,
                directory: paths.dir,
                marker_present,
                pid,
                last_active,
            });
        }
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sessions)
    }

    /// Removes a leftover pidfile. Returns false when there was none.
    pub fn remove_marker(&self, name: &str) -> Result<bool, SessionError> {
        let paths = self.paths(name)?;
        if !paths.dir.is_dir() {
            return Err(SessionError::SessionNotFound(name.to_string()));
        }
        match fs::remove_file(&paths.pidfile) {
            Ok(()) => {
                tracing::info!(path = %paths.pidfile.display(), "removed session marker");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn validate_name(name: &str) -> Result<(), SessionError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(SessionError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> SessionStore {
        SessionStore::with_root(temp.path().join("root"))
    }

    #[test]
    fn paths_follow_session_layout() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let paths = store.paths("default").unwrap();

        assert_eq!(paths.dir, temp.path().join("root").join("default"));
        assert_eq!(paths.pidfile, paths.dir.join("ha.pid"));
        assert_eq!(paths.stdout_log, paths.dir.join("ha.stdout.log"));
        assert_eq!(paths.stderr_log, paths.dir.join("ha.stderr.log"));
        assert_eq!(paths.agent_socket, paths.dir.join("ga.sock"));
        assert!(!paths.dir.exists());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        for name in ["", ".", "..", "a/b", "a\\b"] {
            assert!(
                matches!(store.paths(name), Err(SessionError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn list_sessions_on_missing_root_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(store(&temp).list_sessions().unwrap().is_empty());
    }

    #[test]
    fn list_sessions_reports_markers() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let running = store.ensure_paths("running").unwrap();
        fs::write(&running.pidfile, "4242\n").unwrap();
        fs::write(&running.stdout_log, "").unwrap();
        store.ensure_paths("idle").unwrap();
        fs::write(store.root().join("stray-file"), "").unwrap();

        let sessions = store.list_sessions().unwrap();

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "idle");
        assert!(!sessions[0].marker_present);
        assert_eq!(sessions[0].pid, None);
        assert!(sessions[0].last_active.is_none());
        assert_eq!(sessions[1].name, "running");
        assert!(sessions[1].marker_present);
        assert_eq!(sessions[1].pid, Some(4242));
        assert!(sessions[1].last_active.is_some());
    }

    #[test]
    fn remove_marker_deletes_pidfile_once() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let paths = store.ensure_paths("default").unwrap();
        fs::write(&paths.pidfile, "1\n").unwrap();

        assert!(store.remove_marker("default").unwrap());
        assert!(!paths.pidfile.exists());
        assert!(!store.remove_marker("default").unwrap());
    }

    #[test]
    fn remove_marker_on_unknown_session_errors() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            store(&temp).remove_marker("ghost"),
            Err(SessionError::SessionNotFound(_))
        ));
    }
}
