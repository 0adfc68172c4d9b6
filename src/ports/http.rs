use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{DomainError, GatewayEui};

/// Gateway as registered with the network server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRegistration {
    pub gateway_id: String,
    pub name: String,
    pub description: String,
    pub tenant_id: String,
    pub stats_interval: u32,
}

impl GatewayRegistration {
    pub fn new(eui: &GatewayEui, name: &str, tenant_id: &str) -> Self {
        Self {
            gateway_id: eui.as_str().to_ascii_lowercase(),
            name: name.to_string(),
            description: format!("Registered by loractl {}", env!("CARGO_PKG_VERSION")),
            tenant_id: tenant_id.to_string(),
            stats_interval: 30,
        }
    }
}

/// Port for the network server's management API.
#[async_trait]
pub trait GatewayRegistry: Send + Sync {
    /// Create the gateway. Registering an existing gateway is not an error.
    async fn register(&self, gateway: &GatewayRegistration) -> Result<(), DomainError>;
}
