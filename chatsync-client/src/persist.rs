use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chatsync_core::Identity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `session.json` only ever holds one identity record.
///
/// This prevents pathological reads if the file is corrupted or replaced.
pub const MAX_SESSION_FILE_BYTES: u64 = 64 * 1024;

pub const SESSION_FILE_NAME: &str = "session.json";

/// What survives a restart. Connection handles and loading flags are never written.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PersistedSession {
    #[serde(default)]
    pub identity: Option<Identity>,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("create dir failed: {0}")]
    CreateDir(#[source] io::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
    #[error("remove failed: {0}")]
    Remove(#[source] io::Error),
}

/// On-disk home of the persisted identity. A store without a path keeps nothing.
#[derive(Debug, Clone, Default)]
pub struct IdentityStore {
    path: Option<PathBuf>,
}

impl IdentityStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn ephemeral() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Missing file means nothing was persisted.
    pub fn load(&self) -> Result<Option<Identity>, PersistError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        match load_session_from_path(path) {
            Ok(session) => Ok(session.identity),
            Err(PersistError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn save(&self, identity: &Identity) -> Result<(), PersistError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let session = PersistedSession {
            identity: Some(identity.clone()),
        };
        save_session_to_path(path, &session)
    }

    pub fn clear(&self) -> Result<(), PersistError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PersistError::Remove(err)),
        }
    }
}

/// `$CHATSYNC_DATA_DIR/session.json`, falling back to `~/.local/share/chatsync`.
pub fn default_session_path() -> PathBuf {
    let base = std::env::var_os("CHATSYNC_DATA_DIR")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".local").join("share").join("chatsync"))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(SESSION_FILE_NAME)
}

pub fn load_session_from_path(path: &Path) -> Result<PersistedSession, PersistError> {
    let meta = fs::metadata(path).map_err(PersistError::Metadata)?;
    if meta.len() > MAX_SESSION_FILE_BYTES {
        return Err(PersistError::TooLarge {
            size: meta.len(),
            max: MAX_SESSION_FILE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(PersistError::Read)?;
    serde_json::from_str::<PersistedSession>(&data).map_err(PersistError::Parse)
}

pub fn save_session_to_path(path: &Path, session: &PersistedSession) -> Result<(), PersistError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(PersistError::CreateDir)?;
    }

    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(session).map_err(PersistError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(PersistError::WriteTmp)?;
    fs::rename(&tmp, path).map_err(PersistError::Rename)?;
    Ok(())
}
