use crate::error::{AppError, Result};
use crate::models::{Execution, Playbook};
use crate::state::{latest_version, ExecutionFilter, ExecutionStore, PlaybookStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// In-memory execution and playbook store (for tests and single-process runs)
#[derive(Clone)]
pub struct InMemoryStore {
    executions: Arc<DashMap<Uuid, Execution>>,
    playbooks: Arc<DashMap<Uuid, Vec<Playbook>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            executions: Arc::new(DashMap::new()),
            playbooks: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        match self.executions.entry(execution.id) {
            Entry::Occupied(_) => Err(AppError::Validation(format!(
                "Execution {} already exists",
                execution.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                tracing::debug!(execution_id = %execution.id, "Execution created");
                Ok(())
            }
        }
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        match self.executions.get_mut(&execution.id) {
            Some(mut entry) => {
                *entry = execution.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!(
                "Execution {} not found",
                execution.id
            ))),
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>> {
        Ok(self.executions.get(id).map(|entry| entry.clone()))
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .executions
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn delete_execution(&self, id: &Uuid) -> Result<()> {
        self.executions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", id)))
    }
}

#[async_trait]
impl PlaybookStore for InMemoryStore {
    async fn save_playbook(&self, playbook: &Playbook) -> Result<()> {
        let mut versions = self.playbooks.entry(playbook.id).or_default();
        versions.retain(|p| p.version != playbook.version);
        versions.push(playbook.clone());
        tracing::debug!(playbook_id = %playbook.id, version = %playbook.version, "Playbook saved");
        Ok(())
    }

    async fn get_playbook(&self, id: &Uuid, version: Option<&str>) -> Result<Option<Playbook>> {
        let Some(versions) = self.playbooks.get(id) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.iter().find(|p| p.version == v).cloned(),
            None => latest_version(versions.iter().cloned()),
        })
    }

    async fn list_playbooks(&self) -> Result<Vec<Playbook>> {
        let mut playbooks: Vec<Playbook> = self
            .playbooks
            .iter()
            .filter_map(|entry| latest_version(entry.value().iter().cloned()))
            .collect();
        playbooks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(playbooks)
    }

    async fn playbook_versions(&self, id: &Uuid) -> Result<Vec<Playbook>> {
        let mut versions = self
            .playbooks
            .get(id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        versions.sort_by_key(|p| p.updated_at);
        Ok(versions)
    }

    async fn delete_playbook(&self, id: &Uuid) -> Result<()> {
        self.playbooks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("Playbook {} not found", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, ExecutionMode, ExecutionStatus, PlaybookAction, TriggerDescriptor};
    use chrono::Duration;
    use serde_json::json;

    fn playbook() -> Playbook {
        Playbook::new("store", vec![PlaybookAction::new("a", ActionType::Wait, 1)])
    }

    fn execution(playbook: &Playbook) -> Execution {
        Execution::new(playbook, TriggerDescriptor::manual(json!({})), ExecutionMode::Simulation)
    }

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let store = InMemoryStore::new();
        let execution = execution(&playbook());

        store.create_execution(&execution).await.unwrap();
        assert!(store.create_execution(&execution).await.is_err());
        assert!(store.get_execution(&execution.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = InMemoryStore::new();
        let mut execution = execution(&playbook());
        assert!(matches!(
            store.update_execution(&execution).await,
            Err(AppError::NotFound(_))
        ));

        store.create_execution(&execution).await.unwrap();
        execution.transition_to(ExecutionStatus::Running, "test").unwrap();
        store.update_execution(&execution).await.unwrap();

        let stored = store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let store = InMemoryStore::new();
        let pb = playbook();
        let queued = execution(&pb);
        let mut running = execution(&pb);
        running.transition_to(ExecutionStatus::Running, "test").unwrap();
        let mut done = execution(&pb);
        done.transition_to(ExecutionStatus::Cancelled, "test").unwrap();

        for e in [&queued, &running, &done] {
            store.create_execution(e).await.unwrap();
        }

        let unfinished = store.list_executions(&ExecutionFilter::unfinished()).await.unwrap();
        assert_eq!(unfinished.len(), 2);

        let all = store.list_executions(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        store.delete_execution(&done.id).await.unwrap();
        assert!(store.delete_execution(&done.id).await.is_err());
    }

    #[tokio::test]
    async fn test_playbook_versions() {
        let store = InMemoryStore::new();
        let v1 = playbook();
        let mut v2 = v1.clone();
        v2.version = "2.0.0".to_string();
        v2.updated_at = v1.updated_at + Duration::seconds(10);

        store.save_playbook(&v1).await.unwrap();
        store.save_playbook(&v2).await.unwrap();

        let latest = store.get_playbook(&v1.id, None).await.unwrap().unwrap();
        assert_eq!(latest.version, "2.0.0");
        let pinned = store.get_playbook(&v1.id, Some("1.0.0")).await.unwrap().unwrap();
        assert_eq!(pinned.version, "1.0.0");
        assert_eq!(store.playbook_versions(&v1.id).await.unwrap().len(), 2);
        assert_eq!(store.list_playbooks().await.unwrap().len(), 1);

        store.delete_playbook(&v1.id).await.unwrap();
        assert!(store.get_playbook(&v1.id, None).await.unwrap().is_none());
    }
}
