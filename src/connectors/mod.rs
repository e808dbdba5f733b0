//! Connector capability interface.
//!
//! Live-mode actions never talk to security products directly; they go through a
//! [`ConnectorRegistry`] that knows how to reach each integration category.

pub mod http;

pub use http::HttpConnectorRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::error::AppError;

/// Integration categories reachable through the registry
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectorType {
    Edr,
    Xdr,
    Firewall,
    Siem,
    EmailGateway,
    Identity,
    Cloud,
    Network,
    Ticketing,
    Communication,
    Custom,
}

/// Errors raised while invoking a connector
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("No connector configured for {0}")]
    NotConfigured(ConnectorType),

    #[error("Connector {connector} rejected '{operation}' with status {status}: {body}")]
    Rejected {
        connector: ConnectorType,
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Connector transport error: {0}")]
    Transport(String),

    #[error("Invalid connector response: {0}")]
    InvalidResponse(String),
}

impl From<ConnectorError> for AppError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::NotConfigured(connector) => {
                AppError::Configuration(format!("No connector configured for {}", connector))
            }
            other => AppError::Integration {
                integration_source: "connector".to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Capability registry used by live-mode action handlers
#[async_trait]
pub trait ConnectorRegistry: Send + Sync {
    /// Invoke `operation` on the connector serving `connector`
    async fn invoke(
        &self,
        connector: ConnectorType,
        operation: &str,
        parameters: &JsonValue,
    ) -> Result<JsonValue, ConnectorError>;

    /// Whether a connector is available for the category
    fn supports(&self, connector: ConnectorType) -> bool;
}

/// Registry with no connectors; every live invocation fails with `NotConfigured`
#[derive(Debug, Default, Clone)]
pub struct NoopConnectorRegistry;

#[async_trait]
impl ConnectorRegistry for NoopConnectorRegistry {
    async fn invoke(
        &self,
        connector: ConnectorType,
        _operation: &str,
        _parameters: &JsonValue,
    ) -> Result<JsonValue, ConnectorError> {
        Err(ConnectorError::NotConfigured(connector))
    }

    fn supports(&self, _connector: ConnectorType) -> bool {
        false
    }
}
