use async_trait::async_trait;

use crate::domain::{DeviceHandle, DomainError, EnvironmentProfile};

/// Port for host environment detection.
pub trait EnvironmentDetector: Send + Sync {
    /// Identify the OS and virtualization context.
    ///
    /// Never fails: inconclusive probes yield `Unknown` variants.
    fn detect(&self) -> EnvironmentProfile;
}

/// Port for locating the gateway hardware.
#[async_trait]
pub trait DeviceLocator: Send + Sync {
    /// Probe for an attached gateway. `NotFound` is a normal outcome.
    fn locate(&self, profile: &EnvironmentProfile) -> DeviceHandle;

    /// Pass a bus-attached device through to the build environment and re-probe.
    ///
    /// The default has nothing to pass through and simply probes again.
    async fn attach(
        &self,
        profile: &EnvironmentProfile,
        _device: &DeviceHandle,
    ) -> Result<DeviceHandle, DomainError> {
        Ok(self.locate(profile))
    }
}
