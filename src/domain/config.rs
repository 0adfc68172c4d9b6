use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::device::DeviceModel;
use super::error::DomainError;
use super::region::{PortPair, Region, RegionProfile};
use super::template::BackendEndpoints;

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Enable file logging with rotation.
    pub file_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: true,
        }
    }
}

/// Where and how the gateway software is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Installation root. Defaults to `<data dir>/gateway` when unset.
    pub install_dir: Option<PathBuf>,
    /// Concentrator HAL repository.
    pub hal_repository: String,
    pub hal_branch: String,
    /// Command prefix used to relay the build into a Linux VM.
    pub vm_relay: Vec<String>,
    /// Image tag for the containerized forwarder.
    pub forwarder_image: String,
    /// Timeout for a single build step, in seconds.
    pub step_timeout_secs: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            install_dir: None,
            hal_repository: "https://github.com/Lora-net/sx1302_hal.git".to_string(),
            hal_branch: "master".to_string(),
            vm_relay: vec![
                "multipass".to_string(),
                "exec".to_string(),
                "lora-gateway".to_string(),
                "--".to_string(),
            ],
            forwarder_image: "loractl/packet-forwarder:latest".to_string(),
            step_timeout_secs: 900,
        }
    }
}

/// Gateway-side forwarder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub model: DeviceModel,
    /// Region name; validated when used, never silently replaced.
    pub region: String,
    pub server_address: String,
    pub port_up: u16,
    pub port_down: u16,
    /// Human-readable name used when registering the gateway.
    pub name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let ports = PortPair::default();
        Self {
            model: DeviceModel::default(),
            region: Region::EU868.name().to_string(),
            server_address: "localhost".to_string(),
            port_up: ports.up,
            port_down: ports.down,
            name: "loractl-gateway".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn region_profile(&self) -> Result<RegionProfile, DomainError> {
        RegionProfile::lookup(&self.region)
    }

    pub fn ports(&self) -> PortPair {
        PortPair::new(self.port_up, self.port_down)
    }
}

/// Backend stack settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Directory containing `docker-compose.yml` and the rendered configs.
    pub compose_dir: Option<PathBuf>,
    pub compose_file: String,
    /// ChirpStack REST API base URL.
    pub api_url: String,
    /// API token for gateway registration.
    pub api_token: Zeroizing<String>,
    pub tenant_id: String,
    pub api_secret: Zeroizing<String>,
    /// Lines of service log captured when a health check fails.
    pub diagnostic_log_lines: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            compose_dir: None,
            compose_file: "docker-compose.yml".to_string(),
            api_url: "http://127.0.0.1:8090".to_string(),
            api_token: Zeroizing::new(String::new()),
            tenant_id: String::new(),
            api_secret: Zeroizing::new("you-must-replace-this".to_string()),
            diagnostic_log_lines: 20,
        }
    }
}

impl StackConfig {
    pub fn endpoints(&self) -> BackendEndpoints {
        BackendEndpoints {
            api_secret: self.api_secret.to_string(),
            ..BackendEndpoints::default()
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub install: InstallConfig,
    pub gateway: GatewayConfig,
    pub stack: StackConfig,
}

impl AppConfig {
    /// Create a new AppConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::new();
        assert_eq!(config.gateway.ports(), PortPair::new(1700, 1700));
        assert_eq!(config.gateway.region_profile().unwrap().region, Region::EU868);
        assert!(config.stack.api_token.is_empty());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [gateway]
            region = "US915"
            model = "Rak7371"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.model, DeviceModel::Rak7371);
        assert_eq!(config.gateway.region_profile().unwrap().region, Region::US915);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_region_is_reported_not_defaulted() {
        let mut config = AppConfig::new();
        config.gateway.region = "ZZ000".to_string();
        assert!(matches!(
            config.gateway.region_profile(),
            Err(DomainError::ConfigurationInvalid(_))
        ));
    }
}
