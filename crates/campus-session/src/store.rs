//! Durable session storage
//!
//! Pure persistence: no validation of token contents happens here. The
//! whole session (tokens, user, permissions) is saved and cleared as one
//! unit so partially written state cannot exist.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};
use crate::types::{PermissionSet, SessionUser, TokenPair};

/// Everything persisted between page loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub tokens: TokenPair,
    pub user: SessionUser,
    pub permissions: PermissionSet,
}

/// Session persistence backend.
///
/// `clear` is idempotent and infallible: clearing an empty store is a no-op,
/// and a failed delete must not take the caller down (the session layer
/// treats the cleared state as authoritative regardless).
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    fn save(&self, session: &StoredSession) -> Result<()>;
    fn load(&self) -> Result<Option<StoredSession>>;
    fn clear(&self);
}

/// Volatile store for tests and short-lived processes.
///
/// Cloning shares the underlying slot, which is also how multiple session
/// managers in one process model the "multiple tabs, one storage" setup.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    slot: Arc<RwLock<Option<StoredSession>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for InMemoryStore {
    fn save(&self, session: &StoredSession) -> Result<()> {
        *self.slot.write() = Some(session.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<StoredSession>> {
        Ok(self.slot.read().clone())
    }

    fn clear(&self) {
        *self.slot.write() = None;
    }
}

/// File-backed store: one JSON blob, written atomically.
///
/// Writes go to a sibling temp file first and are moved into place with a
/// rename, so a crash mid-write leaves either the old session or none. A
/// blob that no longer parses is treated as absent and removed, the
/// self-healing counterpart to tampered tokens.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

impl TokenStore for FileStore {
    fn save(&self, session: &StoredSession) -> Result<()> {
        let bytes = serde_json::to_vec(session)
            .map_err(|e| AuthError::Storage(format!("serialize session: {e}")))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuthError::Storage(format!("create session dir: {e}")))?;
        }

        let tmp = self.tmp_path();
        std::fs::write(&tmp, &bytes)
            .map_err(|e| AuthError::Storage(format!("write session file: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| AuthError::Storage(format!("commit session file: {e}")))?;

        Ok(())
    }

    fn load(&self) -> Result<Option<StoredSession>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AuthError::Storage(format!("read session file: {e}"))),
        };

        match serde_json::from_slice(&bytes) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable session file");
                self.clear();
                Ok(None)
            }
        }
    }

    fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, "Failed to remove session file");
        }
        let _ = std::fs::remove_file(self.tmp_path());
    }
}
