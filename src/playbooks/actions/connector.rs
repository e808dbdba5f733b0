use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use super::{connector_payload, ActionHandler, ActionInvocation, CONNECTOR_PARAM};
use crate::connectors::{ConnectorRegistry, ConnectorType};
use crate::playbooks::error::ActionError;
use crate::models::ActionType;

/// How a connector-backed action reaches its integration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorActionSpec {
    pub action_type: ActionType,
    pub connector: ConnectorType,
    pub operation: &'static str,
    pub required: &'static [&'static str],
}

/// Every action type served through the connector registry
pub const CONNECTOR_ACTIONS: &[ConnectorActionSpec] = &[
    ConnectorActionSpec {
        action_type: ActionType::BlockIp,
        connector: ConnectorType::Firewall,
        operation: "block_ip",
        required: &["ip"],
    },
    ConnectorActionSpec {
        action_type: ActionType::IsolateEndpoint,
        connector: ConnectorType::Edr,
        operation: "isolate_host",
        required: &["hostname|endpoint_id"],
    },
    ConnectorActionSpec {
        action_type: ActionType::ResetCredentials,
        connector: ConnectorType::Identity,
        operation: "reset_password",
        required: &["username"],
    },
    ConnectorActionSpec {
        action_type: ActionType::SendNotification,
        connector: ConnectorType::Communication,
        operation: "send_message",
        required: &["message"],
    },
    ConnectorActionSpec {
        action_type: ActionType::CreateTicket,
        connector: ConnectorType::Ticketing,
        operation: "create_ticket",
        required: &["title"],
    },
    ConnectorActionSpec {
        action_type: ActionType::CollectEvidence,
        connector: ConnectorType::Edr,
        operation: "collect_artifacts",
        required: &["target"],
    },
    ConnectorActionSpec {
        action_type: ActionType::RunScan,
        connector: ConnectorType::Xdr,
        operation: "run_scan",
        required: &["target"],
    },
    ConnectorActionSpec {
        action_type: ActionType::UpdateFirewall,
        connector: ConnectorType::Firewall,
        operation: "update_rule",
        required: &["rule"],
    },
    ConnectorActionSpec {
        action_type: ActionType::QuerySiem,
        connector: ConnectorType::Siem,
        operation: "search",
        required: &["query"],
    },
    ConnectorActionSpec {
        action_type: ActionType::EnrichIoc,
        connector: ConnectorType::Xdr,
        operation: "enrich_indicator",
        required: &["indicator"],
    },
    ConnectorActionSpec {
        action_type: ActionType::CustomApi,
        connector: ConnectorType::Custom,
        operation: "request",
        required: &["endpoint|url"],
    },
];

/// Handler for actions that call an external integration
pub struct ConnectorActionHandler {
    spec: &'static ConnectorActionSpec,
    connectors: Arc<dyn ConnectorRegistry>,
}

impl ConnectorActionHandler {
    pub fn new(spec: &'static ConnectorActionSpec, connectors: Arc<dyn ConnectorRegistry>) -> Self {
        Self { spec, connectors }
    }

    fn connector_for(&self, invocation: &ActionInvocation<'_>) -> Result<ConnectorType, ActionError> {
        match invocation.str_param(CONNECTOR_PARAM) {
            Some(name) => ConnectorType::from_str(name).map_err(|_| {
                ActionError::InvalidParameters(format!("unknown connector '{}'", name))
            }),
            None => Ok(self.spec.connector),
        }
    }
}

#[async_trait]
impl ActionHandler for ConnectorActionHandler {
    fn action_type(&self) -> ActionType {
        self.spec.action_type
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        self.spec.required
    }

    async fn execute(&self, invocation: &ActionInvocation<'_>) -> Result<JsonValue, ActionError> {
        let connector = self.connector_for(invocation)?;
        info!(
            execution_id = %invocation.execution_id,
            action_id = %invocation.action.id,
            connector = %connector,
            operation = self.spec.operation,
            "Invoking connector"
        );

        let output = self
            .connectors
            .invoke(connector, self.spec.operation, &connector_payload(invocation.parameters))
            .await?;
        Ok(output)
    }

    async fn simulate(&self, invocation: &ActionInvocation<'_>) -> Result<JsonValue, ActionError> {
        self.connector_for(invocation)?;
        Ok(synthetic_output(
            self.spec.action_type,
            &invocation.action.id,
            invocation.parameters,
        ))
    }
}

// ==================== Synthetic Outputs ====================

/// Stable fingerprint of an action and its resolved parameters
fn fingerprint(action_id: &str, parameters: &Map<String, JsonValue>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action_id.as_bytes());
    hasher.update(JsonValue::Object(connector_payload_map(parameters)).to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn connector_payload_map(parameters: &Map<String, JsonValue>) -> Map<String, JsonValue> {
    match connector_payload(parameters) {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

fn digest_number(digest: &str, modulo: u64) -> u64 {
    u64::from_str_radix(&digest[..12], 16).unwrap_or(0) % modulo
}

fn param_or(parameters: &Map<String, JsonValue>, key: &str, default: JsonValue) -> JsonValue {
    parameters.get(key).cloned().unwrap_or(default)
}

/// Deterministic output for a connector-backed action: same action and parameters, same output
pub fn synthetic_output(
    action_type: ActionType,
    action_id: &str,
    parameters: &Map<String, JsonValue>,
) -> JsonValue {
    let digest = fingerprint(action_id, parameters);
    let short = &digest[..12];
    let p = |key: &str| param_or(parameters, key, JsonValue::Null);

    match action_type {
        ActionType::BlockIp => json!({
            "ip": p("ip"),
            "blocked": true,
            "rule_id": format!("sim-fw-{}", short),
            "duration": p("duration"),
        }),
        ActionType::IsolateEndpoint => json!({
            "endpoint": parameters.get("hostname").or_else(|| parameters.get("endpoint_id")).cloned(),
            "isolated": true,
            "isolation_id": format!("sim-iso-{}", short),
        }),
        ActionType::ResetCredentials => json!({
            "username": p("username"),
            "credentials_reset": true,
            "sessions_revoked": param_or(parameters, "revoke_sessions", json!(true)),
        }),
        ActionType::SendNotification => json!({
            "delivered": true,
            "channel": param_or(parameters, "channel", json!("default")),
            "recipients": param_or(parameters, "recipients", json!([])),
            "message_id": format!("sim-msg-{}", short),
        }),
        ActionType::CreateTicket => json!({
            "ticket_id": format!("SIM-{}", 10_000 + digest_number(&digest, 90_000)),
            "title": p("title"),
            "status": "open",
            "priority": param_or(parameters, "priority", json!("medium")),
        }),
        ActionType::CollectEvidence => json!({
            "target": p("target"),
            "artifacts": param_or(
                parameters,
                "artifact_types",
                json!(["memory_dump", "process_list", "network_connections"])
            ),
            "evidence_id": format!("sim-ev-{}", short),
            "size_bytes": 1_048_576 + digest_number(&digest, 512 * 1_048_576),
        }),
        ActionType::RunScan => json!({
            "target": p("target"),
            "scan_type": param_or(parameters, "scan_type", json!("vulnerability")),
            "scan_id": format!("sim-scan-{}", short),
            "findings": digest_number(&digest, 10),
            "status": "completed",
        }),
        ActionType::UpdateFirewall => json!({
            "rule": p("rule"),
            "applied": true,
            "change_id": format!("sim-chg-{}", short),
        }),
        ActionType::QuerySiem => json!({
            "query": p("query"),
            "hits": digest_number(&digest, 50),
            "search_id": format!("sim-search-{}", short),
            "events": [],
        }),
        ActionType::EnrichIoc => {
            let score = digest_number(&digest, 101);
            let reputation = if score >= 70 {
                "malicious"
            } else if score >= 40 {
                "suspicious"
            } else {
                "benign"
            };
            json!({
                "indicator": p("indicator"),
                "score": score,
                "reputation": reputation,
                "sources": ["simulated-intel"],
            })
        }
        ActionType::CustomApi => json!({
            "endpoint": parameters.get("endpoint").or_else(|| parameters.get("url")).cloned(),
            "status_code": 200,
            "response": {},
        }),
        ActionType::Wait | ActionType::Approval => json!({}),
    }
}
