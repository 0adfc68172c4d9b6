pub mod artifacts;
pub mod controller;
pub mod installer;
pub mod monitor;
pub mod orchestrator;

pub use artifacts::write_artifacts;
pub use controller::{AppController, ControllerOptions};
pub use installer::{InstallPlan, Installer};
pub use monitor::{run_monitor, MonitorFilter, PacketMonitor};
pub use orchestrator::{Orchestrator, OrchestratorFailure, RunningSet};
