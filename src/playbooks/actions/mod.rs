//! Action handlers and the dispatcher that routes actions to them.

mod connector;
mod control;

pub use connector::{ConnectorActionHandler, ConnectorActionSpec, CONNECTOR_ACTIONS};
pub use control::{ApprovalActionHandler, WaitActionHandler};

use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::error::ActionError;
use crate::config::EngineConfig;
use crate::connectors::ConnectorRegistry;
use crate::models::{ActionType, ApprovalRecord, ExecutionMode, PlaybookAction};

/// Parameter that makes a synthetic dispatch fail
pub const SIMULATE_FAILURE_PARAM: &str = "simulate_failure";

/// Parameter limiting injected failures to the first N attempts
pub const SIMULATE_FAILURE_ATTEMPTS_PARAM: &str = "simulate_failure_attempts";

/// Parameter replacing the synthetic output of a dispatch
pub const SIMULATED_OUTPUT_PARAM: &str = "simulated_output";

/// Parameter overriding the connector category of a connector-backed action
pub const CONNECTOR_PARAM: &str = "connector";

/// Parameters consumed by the engine and never forwarded to connectors
pub const ENGINE_PARAMS: &[&str] = &[
    SIMULATE_FAILURE_PARAM,
    SIMULATE_FAILURE_ATTEMPTS_PARAM,
    SIMULATED_OUTPUT_PARAM,
    CONNECTOR_PARAM,
];

/// Everything a handler sees for one attempt
#[derive(Debug, Clone, Copy)]
pub struct ActionInvocation<'a> {
    pub execution_id: Uuid,
    pub action: &'a PlaybookAction,
    pub parameters: &'a Map<String, JsonValue>,
    pub mode: ExecutionMode,
    pub attempt: u32,
    pub approval: Option<&'a ApprovalRecord>,
}

impl<'a> ActionInvocation<'a> {
    pub fn str_param(&self, key: &str) -> Option<&'a str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    pub fn param(&self, key: &str) -> Option<&'a JsonValue> {
        self.parameters.get(key)
    }
}

/// Handler for one action type
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action_type(&self) -> ActionType;

    /// Required parameters; `a|b` accepts either key
    fn required_parameters(&self) -> &'static [&'static str] {
        &[]
    }

    /// Check resolved parameters before dispatch
    fn validate_parameters(&self, parameters: &Map<String, JsonValue>) -> Result<(), ActionError> {
        for required in self.required_parameters() {
            let present = required
                .split('|')
                .any(|key| parameters.get(key).map(is_present).unwrap_or(false));
            if !present {
                return Err(ActionError::InvalidParameters(format!(
                    "'{}' parameter required for {}",
                    required.replace('|', "' or '"),
                    self.action_type()
                )));
            }
        }
        Ok(())
    }

    /// Perform the action against live systems
    async fn execute(&self, invocation: &ActionInvocation<'_>) -> Result<JsonValue, ActionError>;

    /// Produce a deterministic synthetic result without side effects
    async fn simulate(&self, invocation: &ActionInvocation<'_>) -> Result<JsonValue, ActionError>;
}

fn is_present(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.trim().is_empty() && !s.contains("{{"),
        _ => true,
    }
}

/// Registry of action handlers
#[derive(Clone, Default)]
pub struct ActionHandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl ActionHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.action_type(), handler);
    }

    pub fn get(&self, action_type: ActionType) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&action_type).cloned()
    }

    pub fn contains(&self, action_type: ActionType) -> bool {
        self.handlers.contains_key(&action_type)
    }

    pub fn registered_types(&self) -> Vec<ActionType> {
        self.handlers.keys().copied().collect()
    }
}

/// Create a registry with handlers for every built-in action type
pub fn create_default_registry(
    connectors: Arc<dyn ConnectorRegistry>,
    engine: &EngineConfig,
) -> ActionHandlerRegistry {
    let mut registry = ActionHandlerRegistry::new();

    for spec in CONNECTOR_ACTIONS {
        registry.register(Arc::new(ConnectorActionHandler::new(spec, connectors.clone())));
    }

    registry.register(Arc::new(WaitActionHandler::new(engine.max_wait())));
    registry.register(Arc::new(ApprovalActionHandler));

    registry
}

/// A single dispatch request
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub execution_id: Uuid,
    pub action: &'a PlaybookAction,
    pub context: &'a ExecutionContext,
    pub mode: ExecutionMode,
    pub attempt: u32,
    pub approval: Option<&'a ApprovalRecord>,
}

/// Routes an action to its handler, choosing live or synthetic execution by mode
#[derive(Clone)]
pub struct ActionDispatcher {
    registry: ActionHandlerRegistry,
}

impl ActionDispatcher {
    pub fn new(registry: ActionHandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActionHandlerRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, request: DispatchRequest<'_>) -> Result<JsonValue, ActionError> {
        let action = request.action;
        let handler = self
            .registry
            .get(action.action_type)
            .ok_or(ActionError::Unsupported(action.action_type))?;

        let parameters = request.context.substitute_parameters(&action.parameters);
        handler.validate_parameters(&parameters)?;

        let invocation = ActionInvocation {
            execution_id: request.execution_id,
            action,
            parameters: &parameters,
            mode: request.mode,
            attempt: request.attempt,
            approval: request.approval,
        };

        debug!(
            execution_id = %request.execution_id,
            action_id = %action.id,
            action_type = %action.action_type,
            mode = %request.mode,
            attempt = request.attempt,
            "Dispatching action"
        );

        if !request.mode.is_synthetic() {
            return handler.execute(&invocation).await;
        }

        if injected_failure(&parameters, request.attempt) {
            return Err(ActionError::Failed(format!(
                "simulated failure of {} (attempt {})",
                action.id, request.attempt
            )));
        }

        let output = match parameters.get(SIMULATED_OUTPUT_PARAM) {
            Some(output) => output.clone(),
            None => handler.simulate(&invocation).await?,
        };
        Ok(annotate_synthetic(output, request.mode))
    }
}

fn injected_failure(parameters: &Map<String, JsonValue>, attempt: u32) -> bool {
    let enabled = parameters
        .get(SIMULATE_FAILURE_PARAM)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !enabled {
        return false;
    }
    match parameters
        .get(SIMULATE_FAILURE_ATTEMPTS_PARAM)
        .and_then(|v| v.as_u64())
    {
        Some(limit) => u64::from(attempt) <= limit,
        None => true,
    }
}

fn annotate_synthetic(output: JsonValue, mode: ExecutionMode) -> JsonValue {
    match output {
        JsonValue::Object(mut map) => {
            map.insert("simulated".to_string(), JsonValue::Bool(true));
            if mode == ExecutionMode::Test {
                map.insert("mode".to_string(), json!("test"));
            }
            JsonValue::Object(map)
        }
        other => other,
    }
}

/// Parameters forwarded to a connector: everything except engine controls
pub(crate) fn connector_payload(parameters: &Map<String, JsonValue>) -> JsonValue {
    JsonValue::Object(
        parameters
            .iter()
            .filter(|(k, _)| !ENGINE_PARAMS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::NoopConnectorRegistry;
    use crate::models::{Playbook, TriggerDescriptor};
    use strum::IntoEnumIterator;

    fn dispatcher() -> ActionDispatcher {
        ActionDispatcher::new(create_default_registry(
            Arc::new(NoopConnectorRegistry),
            &EngineConfig::default(),
        ))
    }

    fn context() -> ExecutionContext {
        let playbook = Playbook::new("d", vec![PlaybookAction::new("a", ActionType::Wait, 1)]);
        ExecutionContext::seed(
            &playbook,
            &TriggerDescriptor::manual(json!({"source_ip": "203.0.113.9"})),
        )
    }

    fn request<'a>(
        action: &'a PlaybookAction,
        context: &'a ExecutionContext,
        mode: ExecutionMode,
        attempt: u32,
    ) -> DispatchRequest<'a> {
        DispatchRequest {
            execution_id: Uuid::nil(),
            action,
            context,
            mode,
            attempt,
            approval: None,
        }
    }

    #[test]
    fn test_default_registry_covers_every_action_type() {
        let registry = dispatcher().registry().clone();
        for action_type in ActionType::iter() {
            assert!(registry.contains(action_type), "missing handler for {}", action_type);
        }
    }

    #[tokio::test]
    async fn test_simulation_is_deterministic() {
        let dispatcher = dispatcher();
        let ctx = context();
        let action = PlaybookAction::new("block", ActionType::BlockIp, 1)
            .with_param("ip", json!("{{trigger.source_ip}}"));

        let first = dispatcher
            .dispatch(request(&action, &ctx, ExecutionMode::Simulation, 1))
            .await
            .unwrap();
        let second = dispatcher
            .dispatch(request(&action, &ctx, ExecutionMode::Simulation, 1))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first["ip"], json!("203.0.113.9"));
        assert_eq!(first["simulated"], json!(true));
        assert!(first.get("mode").is_none());

        let test_run = dispatcher
            .dispatch(request(&action, &ctx, ExecutionMode::Test, 1))
            .await
            .unwrap();
        assert_eq!(test_run["mode"], json!("test"));
    }

    #[tokio::test]
    async fn test_missing_parameters_are_rejected() {
        let dispatcher = dispatcher();
        let ctx = context();
        let action = PlaybookAction::new("block", ActionType::BlockIp, 1)
            .with_param("ip", json!("{{trigger.unknown}}"));

        let err = dispatcher
            .dispatch(request(&action, &ctx, ExecutionMode::Simulation, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let dispatcher = dispatcher();
        let ctx = context();
        let action = PlaybookAction::new("scan", ActionType::RunScan, 1)
            .with_param("target", json!("web-1"))
            .with_param(SIMULATE_FAILURE_PARAM, json!(true))
            .with_param(SIMULATE_FAILURE_ATTEMPTS_PARAM, json!(1));

        assert!(dispatcher
            .dispatch(request(&action, &ctx, ExecutionMode::Simulation, 1))
            .await
            .is_err());
        assert!(dispatcher
            .dispatch(request(&action, &ctx, ExecutionMode::Simulation, 2))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_simulated_output_override() {
        let dispatcher = dispatcher();
        let ctx = context();
        let action = PlaybookAction::new("enrich", ActionType::EnrichIoc, 1)
            .with_param("indicator", json!("evil.example"))
            .with_param(SIMULATED_OUTPUT_PARAM, json!({"score": 92}));

        let output = dispatcher
            .dispatch(request(&action, &ctx, ExecutionMode::Simulation, 1))
            .await
            .unwrap();
        assert_eq!(output, json!({"score": 92, "simulated": true}));
    }

    #[tokio::test]
    async fn test_live_mode_uses_connectors() {
        let dispatcher = dispatcher();
        let ctx = context();
        let action = PlaybookAction::new("block", ActionType::BlockIp, 1)
            .with_param("ip", json!("10.1.1.1"));

        let err = dispatcher
            .dispatch(request(&action, &ctx, ExecutionMode::Live, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Connector(_)));
    }

    #[test]
    fn test_connector_payload_strips_engine_params() {
        let mut params = Map::new();
        params.insert("ip".to_string(), json!("1.2.3.4"));
        params.insert(SIMULATE_FAILURE_PARAM.to_string(), json!(true));
        params.insert(CONNECTOR_PARAM.to_string(), json!("network"));

        assert_eq!(connector_payload(&params), json!({"ip": "1.2.3.4"}));
    }
}
