use std::path::PathBuf;

use crate::domain::{DomainError, SessionSnapshot};

/// Persistent session state between runs.
pub trait SessionStore: Send + Sync {
    /// Load the cached snapshot.
    ///
    /// Missing or corrupt state yields `None`; detection is always a safe fallback.
    fn load(&self) -> Option<SessionSnapshot>;

    /// Persist the snapshot. Either the whole record is written or nothing is.
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), DomainError>;

    /// Remove any stored state.
    fn clear(&self) -> Result<(), DomainError>;

    /// Location of the state file.
    fn path(&self) -> PathBuf;
}
