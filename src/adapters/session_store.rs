use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::domain::{DomainError, SessionSnapshot};
use crate::ports::SessionStore;

/// Session state as a flat `key=value` file.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// reader sees either the previous or the new snapshot. There is no locking:
/// two concurrent invocations may each overwrite the other's snapshot.
pub struct KeyValueSessionStore {
    path: PathBuf,
}

impl KeyValueSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "session.env".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SessionStore for KeyValueSessionStore {
    fn load(&self) -> Option<SessionSnapshot> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = ?self.path, "No session state");
                return None;
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Session state unreadable, ignoring");
                return None;
            }
        };

        match SessionSnapshot::from_key_values(&content) {
            Ok(snapshot) => {
                debug!(path = ?self.path, "Session state loaded");
                Some(snapshot)
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Session state corrupt, ignoring");
                None
            }
        }
    }

    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), DomainError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut stamped = snapshot.clone();
        stamped.saved_at = Some(Utc::now());

        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(stamped.to_key_values().as_bytes())?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        info!(path = ?self.path, "Session state saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), DomainError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = ?self.path, "Session state cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }
}
