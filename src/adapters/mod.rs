pub mod chirpstack_api;
pub mod command_runner;
pub mod compose_runtime;
pub mod config_store;
pub mod device_probe;
pub mod environment_probe;
pub mod health_probe;
pub mod session_store;

pub use chirpstack_api::ChirpstackRegistry;
pub use command_runner::{RelayedCommandRunner, TokioCommandRunner};
pub use compose_runtime::ComposeRuntime;
pub use config_store::TomlConfigStore;
pub use device_probe::SystemDeviceLocator;
pub use environment_probe::SystemEnvironmentDetector;
pub use health_probe::NetworkHealthProbe;
pub use session_store::KeyValueSessionStore;
