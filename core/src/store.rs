use crate::auth::Session;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// File name of the single persisted session record.
pub const SESSION_RECORD: &str = "auth-storage.json";

/// Persisted session state.
///
/// The record on disk is the source of truth across processes; the in-memory
/// copy is what request paths read so that a token written by a concurrent
/// refresh is visible immediately.
#[derive(Clone)]
pub struct SessionStore {
    root: PathBuf,
    cached: Arc<RwLock<Option<Session>>>,
}

impl SessionStore {
    pub fn new(root: PathBuf) -> Self {
        fs::create_dir_all(&root).ok();
        let cached = match read_record(&root.join(SESSION_RECORD)) {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(%err, "discarding unreadable session record");
                None
            }
        };
        Self {
            root,
            cached: Arc::new(RwLock::new(cached)),
        }
    }

    pub fn in_memory() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("campus-{}", Uuid::new_v4()));
        Self::new(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self) -> PathBuf {
        self.root.join(SESSION_RECORD)
    }

    pub fn current(&self) -> Option<Session> {
        self.cached.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.cached.read().as_ref().map(|s| s.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .and_then(|s| s.refresh_token.clone())
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.record_path();
        let staging = self.root.join(format!("{SESSION_RECORD}.tmp"));
        let serialized = serde_json::to_vec_pretty(session)?;
        *self.cached.write() = Some(session.clone());
        fs::create_dir_all(&self.root).ok();
        fs::write(&staging, serialized)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Replace only the token pair, keeping the stored user profile.
    pub fn update_tokens(&self, access_token: String, refresh_token: Option<String>) -> Result<()> {
        let user = self.current().and_then(|s| s.user);
        self.save(&Session {
            access_token,
            refresh_token,
            user,
        })
    }

    pub fn clear(&self) -> Result<()> {
        *self.cached.write() = None;
        match fs::remove_file(self.record_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("failed to remove session record"),
        }
    }

    /// Re-read the record from disk, picking up changes made by another process.
    pub fn reload(&self) -> Result<Option<Session>> {
        let session = read_record(&self.record_path())?;
        *self.cached.write() = session.clone();
        Ok(session)
    }
}

fn read_record(path: &Path) -> Result<Option<Session>> {
    match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(None),
        Ok(contents) => {
            let session = serde_json::from_str(&contents)
                .with_context(|| format!("invalid session record at {}", path.display()))?;
            Ok(Some(session))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}
