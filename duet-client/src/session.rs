use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use duet_core::{Session, UserProfile};
use thiserror::Error;
use tracing::warn;

/// Defensive bound: `session.json` is expected to be tiny.
///
/// This prevents pathological reads if the file is corrupted or replaced.
pub const MAX_SESSION_FILE_BYTES: u64 = 64 * 1024;

const SESSION_FILE: &str = "session.json";
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(io::Error),
    #[error("rename failed: {0}")]
    Rename(io::Error),
    #[error("remove failed: {0}")]
    Remove(io::Error),
}

/// Durable token + profile snapshot with an in-memory cache.
///
/// Reads never fail: a missing, corrupt, or oversized session file is treated
/// as "not logged in". Writes go through a tmp-file-and-rename cycle with a
/// bounded retry so a concurrent crash never leaves a half-written file.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    cached: Mutex<Option<Session>>,
}

impl SessionStore {
    /// Opens the store at `DUET_STATE_DIR` (or `$HOME/.duet`).
    #[must_use]
    pub fn open_default() -> Self {
        Self::open(default_state_dir().join(SESSION_FILE))
    }

    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let cached = load_session_from_path(&path);
        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    /// Persists token and profile atomically; subsequent reads observe the
    /// new pair even if the durable write fails (the error is surfaced so
    /// the caller can ask the user to retry).
    pub fn set(&self, token: String, user: Option<UserProfile>) -> Result<(), StorageError> {
        let session = Session { token, user };
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(session.clone());
        }
        self.persist(&session)
    }

    /// Wholesale profile replacement on refresh. No-op when unauthenticated.
    pub fn update_profile(&self, user: UserProfile) -> Result<(), StorageError> {
        let updated = {
            let Ok(mut cached) = self.cached.lock() else {
                return Ok(());
            };
            match cached.as_mut() {
                Some(session) => {
                    session.user = Some(user);
                    Some(session.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(session) => self.persist(&session),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.cached
            .lock()
            .ok()
            .and_then(|cached| cached.as_ref().map(|s| s.token.clone()))
    }

    #[must_use]
    pub fn profile(&self) -> Option<UserProfile> {
        self.cached
            .lock()
            .ok()
            .and_then(|cached| cached.as_ref().and_then(|s| s.user.clone()))
    }

    /// Removes token and profile. Idempotent.
    pub fn clear(&self) -> Result<(), StorageError> {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Remove(err)),
        }
    }

    // Immediate bounded retries, no sleeps: callers sit on async paths, and
    // the transient failures worth retrying (a scanner briefly holding the
    // file) resolve or not within a few attempts.
    fn persist(&self, session: &Session) -> Result<(), StorageError> {
        let payload = serde_json::to_string_pretty(session)?;
        let tmp_path = self.path.with_extension("json.tmp");

        let mut last_err = None;
        for _ in 0..MAX_ATTEMPTS {
            let result = fs::write(&tmp_path, payload.as_bytes())
                .map_err(StorageError::WriteTmp)
                .and_then(|()| {
                    fs::rename(&tmp_path, &self.path).map_err(StorageError::Rename)
                });
            match result {
                Ok(()) => return Ok(()),
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| StorageError::WriteTmp(io::Error::other("unreachable"))))
    }
}

fn load_session_from_path(path: &Path) -> Option<Session> {
    let meta = fs::metadata(path).ok()?;
    if meta.len() > MAX_SESSION_FILE_BYTES {
        warn!(
            "ignoring session file {}: {} bytes exceeds {} byte bound",
            path.display(),
            meta.len(),
            MAX_SESSION_FILE_BYTES
        );
        return None;
    }

    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) => {
            warn!("failed to read session file {}: {err}", path.display());
            return None;
        }
    };

    match serde_json::from_str::<Session>(&data) {
        Ok(session) => Some(session),
        Err(err) => {
            warn!("ignoring invalid session file {}: {err}", path.display());
            None
        }
    }
}

fn default_state_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("DUET_STATE_DIR") {
        let dir = PathBuf::from(override_dir);
        let _ = fs::create_dir_all(&dir);
        return dir;
    }

    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join(".duet");
    let _ = fs::create_dir_all(&dir);
    dir
}
