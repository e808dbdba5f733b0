//! Execution lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Execution, ExecutionMode, ExecutionStatus};

/// Lifecycle event published by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A worker picked up the execution
    Started {
        execution_id: Uuid,
        playbook_id: Uuid,
        mode: ExecutionMode,
    },

    /// Execution suspended at an approval gate
    ApprovalRequested {
        execution_id: Uuid,
        action_id: String,
        roles: Vec<String>,
        deadline: Option<DateTime<Utc>>,
    },

    /// Execution reached a terminal state
    Finished {
        execution_id: Uuid,
        playbook_id: Uuid,
        mode: ExecutionMode,
        status: ExecutionStatus,
        duration_ms: Option<i64>,
        successful_actions: u32,
        failed_actions: u32,
        skipped_actions: u32,
    },
}

impl ExecutionEvent {
    pub fn finished(execution: &Execution) -> Self {
        ExecutionEvent::Finished {
            execution_id: execution.id,
            playbook_id: execution.playbook_id,
            mode: execution.mode,
            status: execution.status,
            duration_ms: execution.duration_ms,
            successful_actions: execution.successful_actions,
            failed_actions: execution.failed_actions,
            skipped_actions: execution.skipped_actions,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::ApprovalRequested { execution_id, .. }
            | ExecutionEvent::Finished { execution_id, .. } => *execution_id,
        }
    }
}

/// In-process pub-sub for execution events
#[derive(Clone)]
pub struct ExecutionEventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; events are dropped when nobody listens
    pub fn publish(&self, event: ExecutionEvent) {
        if self.tx.send(event).is_err() {
            debug!("No subscribers for execution event");
        }
    }
}
