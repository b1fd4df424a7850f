//! Session store.
//!
//! One JSON file per session under the data directory. Every mutation runs
//! under the session's mutex and persists the projection through
//! write-temp + rename before the lock is released, so disk always matches
//! what readers can observe. Reserved singleton files in the same directory
//! are skipped at load time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use tal_domain::{Error, Result};

use crate::model::{Session, SessionSummary};

/// Singleton collections living beside the session files.
pub const RESERVED_FILES: &[&str] = &[
    "clients.json",
    "schedules.json",
    "settings.json",
    "users.json",
    "playbooks.json",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live session: state plus its on-disk location, guarded by one mutex.
pub struct SessionHandle {
    path: PathBuf,
    state: Mutex<Session>,
}

impl SessionHandle {
    fn new(path: PathBuf, session: Session) -> Self {
        Self {
            path,
            state: Mutex::new(session),
        }
    }

    /// Read access under the session lock.
    pub fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.state.lock())
    }

    /// Mutate under the session lock and persist before releasing it.
    /// A failed write is logged; memory stays authoritative.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.state.lock();
        let out = f(&mut session);
        if let Err(e) = persist(&self.path, &session) {
            tracing::warn!(
                session_id = %session.id,
                error = %e,
                "failed to persist session"
            );
        }
        out
    }

    /// Mutate volatile state only, with no disk write. Used for autonomous
    /// runtime transitions and the vault, which are never serialized.
    pub fn mutate_volatile<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.state.lock())
    }
}

fn persist(path: &Path, session: &Session) -> Result<()> {
    let json = serde_json::to_string_pretty(session)?;
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;
    let tmp = tempfile::NamedTempFile::new_in(&dir)?;
    std::fs::write(tmp.path(), json)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionStore {
    /// Scan the data directory and reconstruct every persisted session.
    /// Unreadable files are skipped with a warning.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut sessions = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.extension().and_then(|e| e.to_str()) != Some("json")
                || RESERVED_FILES.contains(&name.as_str())
            {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(Error::Io)
                .and_then(|raw| serde_json::from_str::<Session>(&raw).map_err(Error::Json))
            {
                Ok(session) => {
                    sessions.insert(
                        session.id.clone(),
                        Arc::new(SessionHandle::new(path, session)),
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session file");
                }
            }
        }
        tracing::info!(count = sessions.len(), dir = %dir.display(), "sessions loaded");

        Ok(Self {
            dir,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create(
        &self,
        name: String,
        target_scope: Vec<String>,
        notes: String,
        client_id: Option<String>,
    ) -> Arc<SessionHandle> {
        let session = Session::new(name, target_scope, notes, client_id);
        let id = session.id.clone();
        let path = self.dir.join(format!("{id}.json"));
        if let Err(e) = persist(&path, &session) {
            tracing::warn!(session_id = %id, error = %e, "failed to persist new session");
        }
        let handle = Arc::new(SessionHandle::new(path, session));
        self.sessions.write().insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<SessionHandle>> {
        self.get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut all: Vec<SessionSummary> = self
            .sessions
            .read()
            .values()
            .map(|h| h.read(|s| s.summary()))
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Remove the session from memory and disk. Returns the task ids its
    /// event log referenced so the caller can clean artifact directories.
    pub fn delete(&self, id: &str) -> Option<Vec<String>> {
        let handle = self.sessions.write().remove(id)?;
        let task_ids = handle.read(|s| s.task_ids());
        let path = self.dir.join(format!("{id}.json"));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session_id = %id, error = %e, "failed to remove session file");
            }
        }
        Some(task_ids)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
