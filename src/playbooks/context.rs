use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::models::{Playbook, TriggerDescriptor};

static TEMPLATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+|\[\d+\])*)\s*\}\}")
        .expect("template pattern is valid")
});

const VARIABLES_KEY: &str = "variables";
const OUTPUTS_KEY: &str = "outputs";
const PREVIOUS_KEY: &str = "previous";
const TRIGGER_KEY: &str = "trigger";

/// Runtime data visible to conditions and parameter templates.
///
/// Paths resolve against action outputs first (keyed by action id), then `previous` (the most
/// recent output), then variables. Variables hold the playbook variables, the trigger payload
/// under `trigger`, and the payload's top-level fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    variables: Map<String, JsonValue>,
    outputs: Map<String, JsonValue>,
    previous: Option<String>,
}

impl ExecutionContext {
    /// Seed a context from a playbook and its trigger
    pub fn seed(playbook: &Playbook, trigger: &TriggerDescriptor) -> Self {
        let mut variables: Map<String, JsonValue> = playbook
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let JsonValue::Object(fields) = &trigger.payload {
            for (key, value) in fields {
                variables.insert(key.clone(), value.clone());
            }
        }

        variables.insert(TRIGGER_KEY.to_string(), trigger.payload.clone());
        variables.insert(
            "trigger_source".to_string(),
            JsonValue::String(trigger.source.clone()),
        );
        variables.insert(
            "trigger_type".to_string(),
            JsonValue::String(trigger.trigger_type.clone()),
        );

        Self {
            variables,
            outputs: Map::new(),
            previous: None,
        }
    }

    /// Rebuild a context from a persisted snapshot
    pub fn from_snapshot(snapshot: &HashMap<String, JsonValue>) -> Result<Self> {
        let section = |key: &str| -> Result<Map<String, JsonValue>> {
            match snapshot.get(key) {
                None | Some(JsonValue::Null) => Ok(Map::new()),
                Some(JsonValue::Object(map)) => Ok(map.clone()),
                Some(_) => Err(AppError::Serialization(format!(
                    "context snapshot section '{}' is not an object",
                    key
                ))),
            }
        };

        Ok(Self {
            variables: section(VARIABLES_KEY)?,
            outputs: section(OUTPUTS_KEY)?,
            previous: snapshot
                .get(PREVIOUS_KEY)
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    /// Snapshot suitable for storing on the execution record
    pub fn snapshot(&self) -> HashMap<String, JsonValue> {
        let mut snapshot = HashMap::new();
        snapshot.insert(
            VARIABLES_KEY.to_string(),
            JsonValue::Object(self.variables.clone()),
        );
        snapshot.insert(OUTPUTS_KEY.to_string(), JsonValue::Object(self.outputs.clone()));
        snapshot.insert(
            PREVIOUS_KEY.to_string(),
            self.previous
                .clone()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        );
        snapshot
    }

    pub fn variable(&self, key: &str) -> Option<&JsonValue> {
        self.variables.get(key)
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: JsonValue) {
        self.variables.insert(key.into(), value);
    }

    pub fn output(&self, action_id: &str) -> Option<&JsonValue> {
        self.outputs.get(action_id)
    }

    pub fn outputs(&self) -> &Map<String, JsonValue> {
        &self.outputs
    }

    /// Record an action's output. Outputs are append-only.
    pub fn record_output(&mut self, action_id: &str, output: JsonValue) -> Result<()> {
        if self.outputs.contains_key(action_id) {
            return Err(AppError::InvalidStateTransition(format!(
                "output of action {} is already recorded",
                action_id
            )));
        }
        self.outputs.insert(action_id.to_string(), output);
        self.previous = Some(action_id.to_string());
        Ok(())
    }

    /// Resolve a dotted path such as `enrich.score` or `trigger.hosts[0]`
    pub fn resolve(&self, path: &str) -> Option<&JsonValue> {
        let mut segments = split_path(path)?.into_iter();
        let root = match segments.next()? {
            Segment::Key(key) => key,
            Segment::Index(_) => return None,
        };

        let mut current = if let Some(output) = self.outputs.get(root) {
            output
        } else if root == PREVIOUS_KEY {
            self.outputs.get(self.previous.as_deref()?)?
        } else {
            self.variables.get(root)?
        };

        for segment in segments {
            current = match (segment, current) {
                (Segment::Key(key), JsonValue::Object(map)) => map.get(key)?,
                (Segment::Index(i), JsonValue::Array(items)) => items.get(i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Replace `{{path}}` placeholders in a string; unresolved placeholders stay intact
    pub fn substitute_string(&self, template: &str) -> String {
        TEMPLATE_RE
            .replace_all(template, |caps: &regex::Captures| match self.resolve(&caps[1]) {
                Some(JsonValue::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Resolve templates anywhere inside a JSON value.
    ///
    /// A string that is exactly one placeholder takes the referenced value with its JSON type.
    pub fn resolve_template(&self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => {
                if let Some(caps) = TEMPLATE_RE.captures(s) {
                    if &caps[0] == s.trim() {
                        if let Some(resolved) = self.resolve(&caps[1]) {
                            return resolved.clone();
                        }
                    }
                }
                JsonValue::String(self.substitute_string(s))
            }
            JsonValue::Array(items) => {
                JsonValue::Array(items.iter().map(|v| self.resolve_template(v)).collect())
            }
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_template(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve every template in an action's parameters
    pub fn substitute_parameters(
        &self,
        parameters: &HashMap<String, JsonValue>,
    ) -> Map<String, JsonValue> {
        parameters
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_template(v)))
            .collect()
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn split_path(path: &str) -> Option<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    for part in path.trim().split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(Segment::Key(key));
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']')?;
            segments.push(Segment::Index(stripped[..end].parse().ok()?));
            rest = &stripped[end + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, PlaybookAction};
    use serde_json::json;

    fn context() -> ExecutionContext {
        let playbook = Playbook::new("ctx", vec![PlaybookAction::new("a", ActionType::Wait, 1)])
            .with_variable("team", json!("soc"))
            .with_variable("limit", json!(5));
        let trigger = TriggerDescriptor::new(
            "siem",
            "alert",
            json!({"source_ip": "10.0.0.5", "score": 85, "hosts": ["web-1", "web-2"]}),
        );
        ExecutionContext::seed(&playbook, &trigger)
    }

    #[test]
    fn test_seeded_values() {
        let ctx = context();
        assert_eq!(ctx.resolve("team"), Some(&json!("soc")));
        assert_eq!(ctx.resolve("score"), Some(&json!(85)));
        assert_eq!(ctx.resolve("trigger.source_ip"), Some(&json!("10.0.0.5")));
        assert_eq!(ctx.resolve("trigger.hosts[1]"), Some(&json!("web-2")));
        assert_eq!(ctx.resolve("trigger_source"), Some(&json!("siem")));
        assert!(ctx.resolve("trigger.missing").is_none());
        assert!(ctx.resolve("").is_none());
    }

    #[test]
    fn test_outputs_are_append_only() {
        let mut ctx = context();
        ctx.record_output("enrich", json!({"score": 91})).unwrap();
        assert!(ctx.record_output("enrich", json!({"score": 1})).is_err());
        assert_eq!(ctx.resolve("enrich.score"), Some(&json!(91)));
        assert_eq!(ctx.resolve("previous.score"), Some(&json!(91)));
    }

    #[test]
    fn test_substitution() {
        let mut ctx = context();
        ctx.record_output("ticket", json!({"id": "INC-7"})).unwrap();

        assert_eq!(
            ctx.substitute_string("Block {{ trigger.source_ip }} for {{team}} ({{ticket.id}})"),
            "Block 10.0.0.5 for soc (INC-7)"
        );
        assert_eq!(ctx.substitute_string("{{unknown}} stays"), "{{unknown}} stays");

        // whole-string placeholders keep their JSON type
        assert_eq!(ctx.resolve_template(&json!("{{limit}}")), json!(5));
        assert_eq!(ctx.resolve_template(&json!("{{trigger.hosts}}")), json!(["web-1", "web-2"]));
        assert_eq!(
            ctx.resolve_template(&json!({"nested": ["{{score}}", "x{{score}}"]})),
            json!({"nested": [85, "x85"]})
        );
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut ctx = context();
        ctx.record_output("enrich", json!({"reputation": "malicious"})).unwrap();

        let restored = ExecutionContext::from_snapshot(&ctx.snapshot()).unwrap();
        assert_eq!(restored, ctx);
        assert_eq!(restored.resolve("previous.reputation"), Some(&json!("malicious")));
    }

    #[test]
    fn test_malformed_snapshot() {
        let mut snapshot = HashMap::new();
        snapshot.insert(VARIABLES_KEY.to_string(), json!([1, 2]));
        assert!(ExecutionContext::from_snapshot(&snapshot).is_err());
    }
}
