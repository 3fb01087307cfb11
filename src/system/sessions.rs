// src/system/sessions.rs

//! Per-run session directories: `<root>/<YYYYMMDD-HHMMSS>.<pid>/`.
//!
//! Each holds an `env` snapshot and a `status` trace. Background tasks get a
//! `<task id>/` sub-directory of their own.

use crate::{
    constants::{
        SESSION_DIR_KEY, SESSION_ENV_FILENAME, SESSION_ID_KEY, SESSION_STATUS_FILENAME,
        SYS_KEY_PREFIX,
    },
    core::{
        env::{Env, EnvError},
        env_file::save_env_to_file,
    },
    system::status_trace::{ExecutedFlow, StatusError, StatusWriter, parse_status_file},
};
use chrono::{Local, NaiveDateTime, TimeDelta};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const SESSION_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Could not create session directory '{path}': {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Could not read sessions directory '{path}': {source}")]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Env(#[from] EnvError),
}

/// One live session: its directory and its trace writer.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub dir: PathBuf,
    pub trace: Arc<StatusWriter>,
}

impl Session {
    fn open(id: String, dir: PathBuf) -> Result<Self, SessionError> {
        fs::create_dir_all(&dir).map_err(|source| SessionError::Create {
            path: dir.clone(),
            source,
        })?;
        let trace = Arc::new(StatusWriter::open(&dir.join(SESSION_STATUS_FILENAME))?);
        Ok(Self { id, dir, trace })
    }

    pub fn env_path(&self) -> PathBuf {
        self.dir.join(SESSION_ENV_FILENAME)
    }

    /// Records the session's identity in `env` (system keys).
    pub fn bind(&self, env: &Env) {
        env.set(SESSION_ID_KEY, &self.id);
        env.set(SESSION_DIR_KEY, &self.dir.display().to_string());
    }

    /// Writes the visible env (no defaults, no `sys.` keys) to the session snapshot.
    pub fn save_env(&self, env: &Env) -> Result<(), SessionError> {
        save_env_to_file(env, &self.env_path(), false, &[SYS_KEY_PREFIX])?;
        Ok(())
    }

    /// The sub-session a background task writes into.
    pub fn task_session(&self, task_id: &str) -> Result<Self, SessionError> {
        Self::open(task_id.to_string(), self.dir.join(task_id))
    }
}

/// A session as seen from the outside, reconstructed from its directory.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub dir_name: String,
    pub path: PathBuf,
    pub pid: u32,
    pub start: NaiveDateTime,
    pub running: bool,
    pub trace: Option<ExecutedFlow>,
}

/// The sessions root and its retention policy.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    keep: Duration,
}

impl SessionStore {
    pub fn new(root: PathBuf, keep: Duration) -> Self {
        Self { root, keep }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directory for a new top-level run of this process.
    pub fn create_session(&self) -> Result<Session, SessionError> {
        let stamp = Local::now().format(SESSION_STAMP_FORMAT).to_string();
        let pid = std::process::id();
        let base = format!("{}.{}", stamp, pid);

        let mut name = base.clone();
        let mut n = 1;
        while self.root.join(&name).exists() {
            name = format!("{}.{}", base, n);
            n += 1;
        }
        let session = Session::open(name.clone(), self.root.join(&name))?;
        log::debug!("Created session '{}'", session.dir.display());
        Ok(session)
    }

    /// Every session under the root, oldest first.
    pub fn list(&self) -> Result<Vec<SessionStatus>, SessionError> {
        let mut sessions: Vec<SessionStatus> = self
            .session_dirs()?
            .into_iter()
            .map(|(name, path, start, pid)| {
                let trace_path = path.join(SESSION_STATUS_FILENAME);
                let trace = match parse_status_file(&trace_path) {
                    Ok(trace) => Some(trace),
                    Err(e) => {
                        log::warn!("Skipping unreadable trace of session '{}': {}", name, e);
                        None
                    }
                };
                let finished = trace.as_ref().is_some_and(|t| t.finished);
                SessionStatus {
                    dir_name: name,
                    path,
                    pid,
                    start,
                    running: is_pid_alive(pid) && !finished,
                    trace,
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
        Ok(sessions)
    }

    /// Removes sessions whose process is gone and that are older than the retention.
    /// Best-effort: failures are logged and skipped. Returns how many were removed.
    pub fn clean_stale(&self) -> usize {
        let dirs = match self.session_dirs() {
            Ok(dirs) => dirs,
            Err(e) => {
                log::debug!("No session cleanup: {}", e);
                return 0;
            }
        };
        let keep = TimeDelta::from_std(self.keep).unwrap_or(TimeDelta::MAX);
        let now = Local::now().naive_local();
        let mut removed = 0;

        for (name, path, start, pid) in dirs {
            if pid == std::process::id() || is_pid_alive(pid) {
                continue;
            }
            if now.signed_duration_since(start) <= keep {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    log::debug!("Removed stale session '{}'", name);
                    removed += 1;
                }
                Err(e) => log::warn!("Could not remove stale session '{}': {}", name, e),
            }
        }
        removed
    }

    fn session_dirs(&self) -> Result<Vec<(String, PathBuf, NaiveDateTime, u32)>, SessionError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SessionError::ReadRoot {
                    path: self.root.clone(),
                    source,
                });
            }
        };
        Ok(entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let (start, pid) = parse_session_dir_name(&name)?;
                Some((name, entry.path(), start, pid))
            })
            .collect())
    }
}

/// Splits `<YYYYMMDD-HHMMSS>.<pid>[.<n>]` into its start time and pid.
pub fn parse_session_dir_name(name: &str) -> Option<(NaiveDateTime, u32)> {
    let mut parts = name.split('.');
    let stamp = parts.next()?;
    let pid = parts.next()?.parse::<u32>().ok()?;
    let start = NaiveDateTime::parse_from_str(stamp, SESSION_STAMP_FORMAT).ok()?;
    Some((start, pid))
}

/// True if a process with this pid exists (including ones we may not signal).
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// Without a cheap liveness check, every session is treated as owned by a live process.
#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::status_trace::ExecutedResult;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_list_current_session() {
        // --- Setup ---
        let root = tempdir().unwrap();
        let store = SessionStore::new(root.path().to_path_buf(), Duration::from_secs(60));

        // --- Execute ---
        let session = store.create_session().unwrap();
        session.trace.flow_start(0, "echo hi").unwrap();
        session.trace.cmd_start(0, "echo", &BTreeMap::new()).unwrap();
        let listed = store.list().unwrap();

        // --- Assert ---
        assert_eq!(listed.len(), 1);
        let status = listed.first().unwrap();
        assert_eq!(status.pid, std::process::id());
        assert!(status.running);
        assert_eq!(status.dir_name, session.id);

        session
            .trace
            .cmd_finish(0, &BTreeMap::new(), ExecutedResult::Succeeded, None)
            .unwrap();
        session.trace.finish().unwrap();
        assert!(!store.list().unwrap().first().unwrap().running);
    }

    #[test]
    fn test_two_sessions_in_one_second_do_not_collide() {
        let root = tempdir().unwrap();
        let store = SessionStore::new(root.path().to_path_buf(), Duration::from_secs(60));
        let a = store.create_session().unwrap();
        let b = store.create_session().unwrap();
        assert_ne!(a.dir, b.dir);
        assert!(parse_session_dir_name(&b.id).is_some());
    }

    #[test]
    fn test_clean_stale_removes_only_dead_and_old() {
        let root = tempdir().unwrap();
        // i32::MAX is far beyond any pid_max.
        let dead_old = root.path().join(format!("20000101-000000.{}", i32::MAX));
        let live = root.path().join(format!("20000101-000000.{}", std::process::id()));
        let unrelated = root.path().join("not-a-session");
        for dir in [&dead_old, &live, &unrelated] {
            fs::create_dir_all(dir).unwrap();
        }

        let store = SessionStore::new(root.path().to_path_buf(), Duration::from_secs(60));
        assert_eq!(store.clean_stale(), 1);
        assert!(!dead_old.exists());
        assert!(live.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_task_session_nests_and_env_snapshot_skips_sys_keys() {
        let root = tempdir().unwrap();
        let store = SessionStore::new(root.path().to_path_buf(), Duration::from_secs(60));
        let session = store.create_session().unwrap();
        let task = session.task_session("abc").unwrap();
        assert_eq!(task.dir, session.dir.join("abc"));

        let env = Env::new_session_chain();
        session.bind(&env);
        env.set("visible", "1");
        session.save_env(&env).unwrap();
        let content = fs::read_to_string(session.env_path()).unwrap();
        assert!(content.contains("visible"));
        assert!(!content.contains(SESSION_ID_KEY));
    }

    #[test]
    fn test_parse_session_dir_name() {
        let (start, pid) = parse_session_dir_name("20240102-030405.42.1").unwrap();
        assert_eq!(pid, 42);
        assert_eq!(start.format("%H:%M:%S").to_string(), "03:04:05");
        assert!(parse_session_dir_name("garbage").is_none());
    }
}
