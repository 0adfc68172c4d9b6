use std::path::PathBuf;

use crate::domain::{AppConfig, DomainError};

/// Port for the TOML settings file and the directories derived from it.
pub trait ConfigStore: Send + Sync {
    /// Load settings, writing defaults on first use.
    fn load(&self) -> Result<AppConfig, DomainError>;

    fn save(&self, config: &AppConfig) -> Result<(), DomainError>;

    fn config_path(&self) -> PathBuf;

    /// Root for session state, installs and the compose project.
    fn data_dir(&self) -> PathBuf;

    fn logs_dir(&self) -> PathBuf;

    /// Install root used when `install.install_dir` is unset.
    fn default_install_dir(&self) -> PathBuf {
        self.data_dir().join("gateway")
    }

    /// Compose project used when `stack.compose_dir` is unset.
    fn default_compose_dir(&self) -> PathBuf {
        self.data_dir().join("stack")
    }

    fn session_path(&self) -> PathBuf {
        self.data_dir().join("session.env")
    }
}
