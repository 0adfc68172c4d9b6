use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::domain::{ConfigArtifact, DomainError};

/// Write rendered artifacts below `dir`, creating directories as needed.
///
/// Returns the written paths in artifact order.
pub fn write_artifacts<'a, I>(dir: &Path, artifacts: I) -> Result<Vec<PathBuf>, DomainError>
where
    I: IntoIterator<Item = &'a ConfigArtifact>,
{
    let mut written = Vec::new();
    for artifact in artifacts {
        if artifact.path.is_absolute() {
            return Err(DomainError::ConfigurationInvalid(format!(
                "artifact path {} must be relative",
                artifact.path.display()
            )));
        }
        let target = dir.join(&artifact.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &artifact.contents)?;
        debug!(path = ?target, bytes = artifact.contents.len(), "Artifact written");
        written.push(target);
    }
    Ok(written)
}
