use crate::config::{StateBackend, StateConfig};
use crate::error::{AppError, Result};
use crate::state::{ExecutionStore, InMemoryStore, PlaybookStore, SledStore};
use std::sync::Arc;

/// Execution and playbook stores sharing one backend
#[derive(Clone)]
pub struct Stores {
    pub executions: Arc<dyn ExecutionStore>,
    pub playbooks: Arc<dyn PlaybookStore>,
}

/// Create the stores selected by configuration
pub fn create_store(config: &StateConfig) -> Result<Stores> {
    match config.backend {
        StateBackend::Sled => {
            let path = config.path.as_ref().ok_or_else(|| {
                AppError::Configuration("Sled backend requires 'path' configuration".to_string())
            })?;

            tracing::info!(path = ?path, "Initializing Sled storage backend");

            let store = Arc::new(SledStore::new(path)?);
            Ok(Stores {
                executions: store.clone(),
                playbooks: store,
            })
        }
        StateBackend::Memory => Ok(create_in_memory_store()),
    }
}

/// Create in-memory stores (for testing and development)
pub fn create_in_memory_store() -> Stores {
    tracing::info!("Initializing in-memory storage backend");
    let store = Arc::new(InMemoryStore::new());
    Stores {
        executions: store.clone(),
        playbooks: store,
    }
}
