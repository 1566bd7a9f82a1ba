//! In-memory storage — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use cortex_core::SessionStorage;
use cortex_core::error::MemoryError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Records kept in a map; gone when the process exits.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    records: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for InMemoryStorage {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn read(&self, session_id: &str) -> Result<Option<String>, MemoryError> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn write(&self, session_id: &str, record: &str) -> Result<(), MemoryError> {
        self.records
            .write()
            .await
            .insert(session_id.to_string(), record.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, MemoryError> {
        Ok(self.records.read().await.keys().cloned().collect())
    }
}
