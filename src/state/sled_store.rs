use crate::error::{AppError, Result};
use crate::models::{Execution, Playbook};
use crate::state::{latest_version, ExecutionFilter, ExecutionStore, PlaybookStore};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Persistent execution and playbook store using Sled embedded database.
///
/// Records are stored as JSON: execution contexts and action outputs are arbitrary JSON values,
/// which non-self-describing formats cannot round-trip.
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    executions_tree: sled::Tree,
    playbooks_tree: sled::Tree,
}

impl SledStore {
    /// Open (or create) a Sled store at the specified path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| AppError::Database(format!("Failed to open Sled database: {}", e)))?;

        let executions_tree = db
            .open_tree("executions")
            .map_err(|e| AppError::Database(format!("Failed to open executions tree: {}", e)))?;

        let playbooks_tree = db
            .open_tree("playbooks")
            .map_err(|e| AppError::Database(format!("Failed to open playbooks tree: {}", e)))?;

        tracing::info!(path = ?path.as_ref(), "Initialized Sled store");

        Ok(Self {
            db: Arc::new(db),
            executions_tree,
            playbooks_tree,
        })
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| AppError::Serialization(format!("Failed to encode record: {}", e)))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| AppError::Serialization(format!("Failed to decode record: {}", e)))
    }

    fn execution_key(id: &Uuid) -> Vec<u8> {
        id.as_bytes().to_vec()
    }

    /// `<playbook id><version>`; the 16-byte id prefix groups every version of a playbook
    fn playbook_key(id: &Uuid, version: &str) -> Vec<u8> {
        let mut key = id.as_bytes().to_vec();
        key.extend_from_slice(version.as_bytes());
        key
    }

    /// Flush all pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| AppError::Database(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }

    /// Get database size on disk
    pub fn size_on_disk(&self) -> Result<u64> {
        self.db
            .size_on_disk()
            .map_err(|e| AppError::Database(format!("Failed to get database size: {}", e)))
    }

    fn versions(&self, id: &Uuid) -> Result<Vec<Playbook>> {
        self.playbooks_tree
            .scan_prefix(id.as_bytes())
            .map(|entry| {
                let (_, value) = entry.map_err(|e| {
                    AppError::Database(format!("Failed to iterate playbooks: {}", e))
                })?;
                Self::decode(&value)
            })
            .collect()
    }
}

#[async_trait]
impl ExecutionStore for SledStore {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        let key = Self::execution_key(&execution.id);
        let value = Self::encode(execution)?;

        self.executions_tree
            .compare_and_swap(&key, None as Option<&[u8]>, Some(value))
            .map_err(|e| AppError::Database(format!("Failed to create execution: {}", e)))?
            .map_err(|_| {
                AppError::Validation(format!("Execution {} already exists", execution.id))
            })?;

        self.flush().await?;
        tracing::debug!(execution_id = %execution.id, "Execution created in Sled");
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        let key = Self::execution_key(&execution.id);

        if !self.executions_tree.contains_key(&key).map_err(|e| {
            AppError::Database(format!("Failed to check execution existence: {}", e))
        })? {
            return Err(AppError::NotFound(format!(
                "Execution {} not found",
                execution.id
            )));
        }

        let value = Self::encode(execution)?;
        self.executions_tree
            .insert(&key, value)
            .map_err(|e| AppError::Database(format!("Failed to update execution: {}", e)))?;

        self.flush().await?;
        tracing::debug!(
            execution_id = %execution.id,
            status = %execution.status,
            "Execution updated in Sled"
        );
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>> {
        match self.executions_tree.get(Self::execution_key(id)) {
            Ok(Some(bytes)) => Ok(Some(Self::decode(&bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(AppError::Database(format!("Failed to get execution: {}", e))),
        }
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut executions = Vec::new();

        for entry in self.executions_tree.iter() {
            let (_, value) = entry.map_err(|e| {
                AppError::Database(format!("Failed to iterate executions: {}", e))
            })?;
            let execution: Execution = Self::decode(&value)?;
            if filter.matches(&execution) {
                executions.push(execution);
            }
        }

        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn delete_execution(&self, id: &Uuid) -> Result<()> {
        let removed = self
            .executions_tree
            .remove(Self::execution_key(id))
            .map_err(|e| AppError::Database(format!("Failed to delete execution: {}", e)))?;

        if removed.is_none() {
            return Err(AppError::NotFound(format!("Execution {} not found", id)));
        }
        self.flush().await
    }
}

#[async_trait]
impl PlaybookStore for SledStore {
    async fn save_playbook(&self, playbook: &Playbook) -> Result<()> {
        let key = Self::playbook_key(&playbook.id, &playbook.version);
        self.playbooks_tree
            .insert(key, Self::encode(playbook)?)
            .map_err(|e| AppError::Database(format!("Failed to save playbook: {}", e)))?;

        self.flush().await?;
        tracing::debug!(playbook_id = %playbook.id, version = %playbook.version, "Playbook saved to Sled");
        Ok(())
    }

    async fn get_playbook(&self, id: &Uuid, version: Option<&str>) -> Result<Option<Playbook>> {
        match version {
            Some(version) => match self.playbooks_tree.get(Self::playbook_key(id, version)) {
                Ok(Some(bytes)) => Ok(Some(Self::decode(&bytes)?)),
                Ok(None) => Ok(None),
                Err(e) => Err(AppError::Database(format!("Failed to get playbook: {}", e))),
            },
            None => Ok(latest_version(self.versions(id)?)),
        }
    }

    async fn list_playbooks(&self) -> Result<Vec<Playbook>> {
        let mut latest: std::collections::HashMap<Uuid, Playbook> = std::collections::HashMap::new();

        for entry in self.playbooks_tree.iter() {
            let (_, value) = entry.map_err(|e| {
                AppError::Database(format!("Failed to iterate playbooks: {}", e))
            })?;
            let playbook: Playbook = Self::decode(&value)?;
            match latest.get(&playbook.id) {
                Some(current) if current.updated_at >= playbook.updated_at => {}
                _ => {
                    latest.insert(playbook.id, playbook);
                }
            }
        }

        let mut playbooks: Vec<Playbook> = latest.into_values().collect();
        playbooks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(playbooks)
    }

    async fn playbook_versions(&self, id: &Uuid) -> Result<Vec<Playbook>> {
        let mut versions = self.versions(id)?;
        versions.sort_by_key(|p| p.updated_at);
        Ok(versions)
    }

    async fn delete_playbook(&self, id: &Uuid) -> Result<()> {
        let keys: Vec<sled::IVec> = self
            .playbooks_tree
            .scan_prefix(id.as_bytes())
            .keys()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| AppError::Database(format!("Failed to iterate playbooks: {}", e)))?;

        if keys.is_empty() {
            return Err(AppError::NotFound(format!("Playbook {} not found", id)));
        }

        for key in keys {
            self.playbooks_tree
                .remove(key)
                .map_err(|e| AppError::Database(format!("Failed to delete playbook: {}", e)))?;
        }
        self.flush().await
    }
}
