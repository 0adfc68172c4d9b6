use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::device::DeviceModel;
use super::region::Region;

/// Installation state of the gateway software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InstallStatus {
    #[default]
    NotInstalled,
    Installed,
    InstalledContainerized,
}

impl InstallStatus {
    pub fn is_installed(&self) -> bool {
        !matches!(self, InstallStatus::NotInstalled)
    }
}

impl std::fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallStatus::NotInstalled => write!(f, "not_installed"),
            InstallStatus::Installed => write!(f, "installed"),
            InstallStatus::InstalledContainerized => write!(f, "installed_containerized"),
        }
    }
}

impl FromStr for InstallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "not_installed" => Ok(InstallStatus::NotInstalled),
            "installed" => Ok(InstallStatus::Installed),
            "installed_containerized" => Ok(InstallStatus::InstalledContainerized),
            other => Err(format!("unknown install status '{}'", other)),
        }
    }
}

/// Durable record written by the installer and reloaded on the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationRecord {
    pub status: InstallStatus,
    pub install_path: Option<PathBuf>,
    pub device_model: DeviceModel,
    pub region: Region,
}

impl InstallationRecord {
    /// Directory holding the forwarder binaries and frequency plans.
    pub fn bin_dir(&self) -> Option<PathBuf> {
        self.install_path.as_ref().map(|p| p.join("bin"))
    }
}
