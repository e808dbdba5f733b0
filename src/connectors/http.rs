use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ConnectorError, ConnectorRegistry, ConnectorType};
use crate::config::ConnectorsConfig;
use crate::error::{AppError, Result};

/// Connector registry that forwards invocations to HTTP gateways.
///
/// Each connector category maps to a base URL; an invocation POSTs the resolved action
/// parameters as JSON to `{base_url}/{operation}` and returns the JSON response body.
pub struct HttpConnectorRegistry {
    client: Client,
    endpoints: HashMap<ConnectorType, String>,
    auth_token: Option<String>,
}

impl HttpConnectorRegistry {
    /// Create a registry with explicit endpoints
    pub fn new(endpoints: HashMap<ConnectorType, String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|(k, v)| (k, v.trim_end_matches('/').to_string()))
                .collect(),
            auth_token: None,
        })
    }

    /// Create a registry from configuration
    pub fn from_config(config: &ConnectorsConfig) -> Result<Self> {
        let mut endpoints = HashMap::new();
        for (name, url) in &config.endpoints {
            let connector = ConnectorType::from_str(name).map_err(|_| {
                AppError::Configuration(format!("Unknown connector type in config: {}", name))
            })?;
            endpoints.insert(connector, url.clone());
        }

        let mut registry = Self::new(endpoints, Duration::from_secs(config.timeout_secs))?;
        if let Some(env) = &config.auth_token_env {
            match std::env::var(env) {
                Ok(token) => registry.auth_token = Some(token),
                Err(_) => warn!(env = %env, "Connector auth token variable is not set"),
            }
        }
        Ok(registry)
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[async_trait]
impl ConnectorRegistry for HttpConnectorRegistry {
    async fn invoke(
        &self,
        connector: ConnectorType,
        operation: &str,
        parameters: &JsonValue,
    ) -> std::result::Result<JsonValue, ConnectorError> {
        let base = self
            .endpoints
            .get(&connector)
            .ok_or(ConnectorError::NotConfigured(connector))?;
        let url = format!("{}/{}", base, operation);

        debug!(connector = %connector, operation = %operation, url = %url, "Invoking connector");

        let mut request = self.client.post(&url).json(parameters);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ConnectorError::Rejected {
                connector,
                operation: operation.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(JsonValue::Object(serde_json::Map::new()));
        }

        serde_json::from_str(&body).map_err(|e| ConnectorError::InvalidResponse(e.to_string()))
    }

    fn supports(&self, connector: ConnectorType) -> bool {
        self.endpoints.contains_key(&connector)
    }
}
