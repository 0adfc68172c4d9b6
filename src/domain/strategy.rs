use serde::{Deserialize, Serialize};

use super::environment::{EnvironmentProfile, OsType, Virtualization};
use super::error::DomainError;

/// How the gateway software gets built on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStrategy {
    /// Build the HAL directly on this Linux host.
    NativeBuild,
    /// Build the forwarder into a container image.
    ContainerizedBuild,
    /// Run the native build inside WSL from a Windows host.
    WslRelayedBuild,
    /// Run the native build inside a Linux VM with USB passthrough.
    VmPassthrough,
}

impl InstallStrategy {
    /// Whether the strategy needs the gateway attached while installing.
    pub fn requires_device(&self) -> bool {
        !matches!(self, InstallStrategy::ContainerizedBuild)
    }
}

impl std::fmt::Display for InstallStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallStrategy::NativeBuild => write!(f, "native build"),
            InstallStrategy::ContainerizedBuild => write!(f, "containerized build"),
            InstallStrategy::WslRelayedBuild => write!(f, "WSL-relayed build"),
            InstallStrategy::VmPassthrough => write!(f, "VM passthrough build"),
        }
    }
}

/// Map a host environment to an installation strategy.
///
/// `prefer_vm` only affects macOS, where the default is a container build.
pub fn select_strategy(
    profile: EnvironmentProfile,
    prefer_vm: bool,
) -> Result<InstallStrategy, DomainError> {
    match (profile.os, profile.virtualization) {
        (OsType::Linux, Virtualization::Native)
        | (OsType::Linux, Virtualization::Vm)
        | (OsType::Linux, Virtualization::Wsl)
        | (OsType::Linux, Virtualization::Container)
        | (OsType::Linux, Virtualization::Unknown) => Ok(InstallStrategy::NativeBuild),

        (OsType::Windows, Virtualization::Wsl) => Ok(InstallStrategy::WslRelayedBuild),
        (OsType::Windows, Virtualization::Native)
        | (OsType::Windows, Virtualization::Vm)
        | (OsType::Windows, Virtualization::Container)
        | (OsType::Windows, Virtualization::Unknown) => Err(DomainError::UnsupportedEnvironment(
            "Windows without WSL; run `wsl --install` and reboot, then retry".to_string(),
        )),

        (OsType::MacOS, _) if prefer_vm => Ok(InstallStrategy::VmPassthrough),
        (OsType::MacOS, _) => Ok(InstallStrategy::ContainerizedBuild),

        (OsType::Unknown, _) => Err(DomainError::UnsupportedEnvironment(
            "could not identify the host operating system".to_string(),
        )),
    }
}
