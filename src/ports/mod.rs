pub mod command;
pub mod config;
pub mod container;
pub mod environment;
pub mod http;
pub mod session;

pub use command::{CommandOutput, CommandRunner, CommandSpec};
pub use config::ConfigStore;
pub use container::{ContainerRuntime, HealthProbe};
pub use environment::{DeviceLocator, EnvironmentDetector};
pub use http::{GatewayRegistration, GatewayRegistry};
pub use session::SessionStore;
