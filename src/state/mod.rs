pub mod factory;
pub mod sled_store;
pub mod store;

pub use factory::{create_in_memory_store, create_store, Stores};
pub use sled_store::SledStore;
pub use store::*;

use crate::error::Result;
use crate::models::{Execution, ExecutionMode, ExecutionStatus, Playbook};
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence of execution records
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Store a new execution; fails if the id already exists
    async fn create_execution(&self, execution: &Execution) -> Result<()>;

    /// Replace a stored execution; fails if it does not exist
    async fn update_execution(&self, execution: &Execution) -> Result<()>;

    /// Get an execution by ID
    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>>;

    /// List executions matching a filter, oldest first
    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>>;

    /// Delete an execution
    async fn delete_execution(&self, id: &Uuid) -> Result<()>;
}

/// Versioned playbook definitions
#[async_trait]
pub trait PlaybookStore: Send + Sync {
    /// Save a playbook version, replacing an existing one with the same id and version
    async fn save_playbook(&self, playbook: &Playbook) -> Result<()>;

    /// Get a specific version, or the most recently updated one
    async fn get_playbook(&self, id: &Uuid, version: Option<&str>) -> Result<Option<Playbook>>;

    /// Latest version of every playbook
    async fn list_playbooks(&self) -> Result<Vec<Playbook>>;

    /// Every stored version of a playbook, oldest first
    async fn playbook_versions(&self, id: &Uuid) -> Result<Vec<Playbook>>;

    /// Delete all versions of a playbook
    async fn delete_playbook(&self, id: &Uuid) -> Result<()>;
}

/// Filter for querying executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub statuses: Vec<ExecutionStatus>,
    pub playbook_id: Option<Uuid>,
    pub mode: Option<ExecutionMode>,
}

impl ExecutionFilter {
    /// Executions that have not reached a terminal state
    pub fn unfinished() -> Self {
        Self {
            statuses: vec![
                ExecutionStatus::Queued,
                ExecutionStatus::Running,
                ExecutionStatus::AwaitingApproval,
            ],
            ..Default::default()
        }
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&execution.status))
            && self.playbook_id.map_or(true, |id| execution.playbook_id == id)
            && self.mode.map_or(true, |mode| execution.mode == mode)
    }
}

/// Pick the most recently updated version
pub(crate) fn latest_version(versions: impl IntoIterator<Item = Playbook>) -> Option<Playbook> {
    versions.into_iter().max_by_key(|p| p.updated_at)
}
