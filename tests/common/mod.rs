//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use soar_engine::{
    config::Config,
    connectors::{ConnectorError, ConnectorRegistry, ConnectorType},
    models::{ActionType, OnErrorPolicy, Playbook, PlaybookAction},
    playbooks::{
        create_default_registry, ActionDispatcher, AllowAllAuthorizer, ApprovalGate, Authorizer,
        Orchestrator,
    },
    state::{ExecutionStore, InMemoryStore},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One recorded connector invocation
#[derive(Debug, Clone)]
pub struct ConnectorCall {
    pub connector: ConnectorType,
    pub operation: String,
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, Default)]
struct Script {
    /// Remaining failures; `None` fails forever
    failures: Option<Option<u32>>,
    delay: Option<Duration>,
    response: Option<JsonValue>,
    panics: bool,
}

/// Connector registry whose behaviour is scripted per operation and which records every call
#[derive(Default)]
pub struct ScriptedConnectors {
    calls: Mutex<Vec<ConnectorCall>>,
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedConnectors {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every call of an operation
    pub fn fail_always(&self, operation: &str) {
        self.scripts.lock().entry(operation.to_string()).or_default().failures = Some(None);
    }

    /// Fail the first `times` calls of an operation
    pub fn fail_times(&self, operation: &str, times: u32) {
        self.scripts.lock().entry(operation.to_string()).or_default().failures = Some(Some(times));
    }

    pub fn delay(&self, operation: &str, delay: Duration) {
        self.scripts.lock().entry(operation.to_string()).or_default().delay = Some(delay);
    }

    /// Panic inside every call of an operation
    pub fn panic_on(&self, operation: &str) {
        self.scripts.lock().entry(operation.to_string()).or_default().panics = true;
    }

    pub fn respond(&self, operation: &str, response: JsonValue) {
        self.scripts.lock().entry(operation.to_string()).or_default().response = Some(response);
    }

    pub fn calls(&self) -> Vec<ConnectorCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.operation == operation).count()
    }

    fn should_fail(&self, operation: &str) -> bool {
        let mut scripts = self.scripts.lock();
        let Some(script) = scripts.get_mut(operation) else {
            return false;
        };
        match &mut script.failures {
            Some(None) => true,
            Some(Some(0)) | None => false,
            Some(Some(remaining)) => {
                *remaining -= 1;
                true
            }
        }
    }
}

#[async_trait]
impl ConnectorRegistry for ScriptedConnectors {
    async fn invoke(
        &self,
        connector: ConnectorType,
        operation: &str,
        parameters: &JsonValue,
    ) -> Result<JsonValue, ConnectorError> {
        self.calls.lock().push(ConnectorCall {
            connector,
            operation: operation.to_string(),
            parameters: parameters.clone(),
        });

        let (delay, response, panics) = {
            let scripts = self.scripts.lock();
            let script = scripts.get(operation).cloned().unwrap_or_default();
            (script.delay, script.response, script.panics)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if panics {
            panic!("scripted panic in {}", operation);
        }

        if self.should_fail(operation) {
            return Err(ConnectorError::Rejected {
                connector,
                operation: operation.to_string(),
                status: 503,
                body: "scripted failure".to_string(),
            });
        }

        Ok(response.unwrap_or_else(|| json!({"ok": true, "operation": operation})))
    }

    fn supports(&self, _connector: ConnectorType) -> bool {
        true
    }
}

/// Configuration with millisecond backoff so retry tests stay fast
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.backoff_base_ms = 5;
    config.retry.max_backoff_ms = 50;
    config
}

/// Orchestrator over an in-memory store
pub fn engine(connectors: Arc<dyn ConnectorRegistry>) -> Arc<Orchestrator> {
    engine_with(connectors, Arc::new(AllowAllAuthorizer), &fast_config())
}

pub fn engine_with(
    connectors: Arc<dyn ConnectorRegistry>,
    authorizer: Arc<dyn Authorizer>,
    config: &Config,
) -> Arc<Orchestrator> {
    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryStore::new());
    engine_on(store, connectors, authorizer, config)
}

pub fn engine_on(
    store: Arc<dyn ExecutionStore>,
    connectors: Arc<dyn ConnectorRegistry>,
    authorizer: Arc<dyn Authorizer>,
    config: &Config,
) -> Arc<Orchestrator> {
    let registry = create_default_registry(connectors, &config.engine);
    Arc::new(Orchestrator::new(
        Arc::new(ActionDispatcher::new(registry)),
        Arc::new(ApprovalGate::new(authorizer, config.approval.timeout())),
        store,
        config,
    ))
}

pub fn ticket(order: u32) -> PlaybookAction {
    PlaybookAction::new("ticket", ActionType::CreateTicket, order)
        .with_param("title", json!("Suspicious traffic from {{source_ip}}"))
}

pub fn block(order: u32) -> PlaybookAction {
    PlaybookAction::new("block", ActionType::BlockIp, order).with_param("ip", json!("{{source_ip}}"))
}

pub fn notify(order: u32) -> PlaybookAction {
    PlaybookAction::new("notify", ActionType::SendNotification, order)
        .with_param("channel", json!("#soc"))
        .with_param("message", json!("Handled {{source_ip}}"))
}

/// ticket -> block -> notify, with the given policy on the block step
pub fn three_step_playbook(on_error: OnErrorPolicy) -> Playbook {
    Playbook::new(
        "Contain Source IP",
        vec![
            ticket(1),
            block(2)
                .with_on_error(on_error)
                .with_retry(soar_engine::models::RetryConfig::attempts(1)),
            notify(3),
        ],
    )
}

pub fn alert_payload() -> JsonValue {
    json!({
        "source_ip": "198.51.100.23",
        "hostname": "fin-ws-042",
        "username": "j.doe",
        "score": 85
    })
}
