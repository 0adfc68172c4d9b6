pub mod config;
pub mod device;
pub mod environment;
pub mod error;
pub mod install;
pub mod packet;
pub mod region;
pub mod session;
pub mod strategy;
pub mod template;
pub mod topology;

pub use config::AppConfig;
pub use device::{DeviceHandle, DeviceModel, DeviceStatus, GatewayEui};
pub use environment::{EnvironmentProfile, OsType, Virtualization};
pub use error::DomainError;
pub use install::{InstallStatus, InstallationRecord};
pub use region::{PortPair, Region, RegionProfile};
pub use session::SessionSnapshot;
pub use strategy::{select_strategy, InstallStrategy};
pub use template::{BackendEndpoints, ConfigArtifact};
pub use topology::{HealthCheck, ServiceSpec, ServiceState, ServiceTopology};
