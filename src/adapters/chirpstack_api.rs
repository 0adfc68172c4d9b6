use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::info;
use url::Url;
use zeroize::Zeroizing;

use crate::domain::DomainError;
use crate::ports::{GatewayRegistration, GatewayRegistry};

#[derive(Serialize)]
struct CreateGatewayRequest<'a> {
    gateway: &'a GatewayRegistration,
}

/// Registers gateways through the ChirpStack REST API proxy.
pub struct ChirpstackRegistry {
    client: reqwest::Client,
    endpoint: Url,
    token: Zeroizing<String>,
}

impl ChirpstackRegistry {
    pub fn new(api_url: &str, token: Zeroizing<String>) -> Result<Self, DomainError> {
        if token.trim().is_empty() {
            return Err(DomainError::ConfigurationInvalid(
                "stack.api_token is empty; create an API key in the ChirpStack UI".to_string(),
            ));
        }
        let base = Url::parse(api_url).map_err(|e| {
            DomainError::ConfigurationInvalid(format!("invalid api_url '{}': {}", api_url, e))
        })?;
        let endpoint = base
            .join("/api/gateways")
            .map_err(|e| DomainError::ConfigurationInvalid(e.to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            token,
        })
    }
}

#[async_trait]
impl GatewayRegistry for ChirpstackRegistry {
    async fn register(&self, gateway: &GatewayRegistration) -> Result<(), DomainError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.token.as_str())
            .json(&CreateGatewayRequest { gateway })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            info!(gateway_id = %gateway.gateway_id, "Gateway already registered");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DomainError::HttpRequest(format!(
                "POST {} returned {}: {}",
                self.endpoint,
                status,
                body.trim()
            )));
        }

        info!(gateway_id = %gateway.gateway_id, "Gateway registered");
        Ok(())
    }
}
