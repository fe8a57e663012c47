use async_trait::async_trait;
use log::{debug, error};
use std::sync::Arc;

use super::models::{record_timestamp, RegisterRecord};
use crate::modbus::types::RegisterBlockType;
use crate::services::connection::RegisterWriteListener;
use crate::utils::error::ServerError;

/// Durable storage for register values.
#[async_trait]
pub trait RegisterDao: Send + Sync {
    /// Insert a record, or update value and modified date of an existing one.
    async fn save(&self, record: &RegisterRecord) -> Result<(), ServerError>;

    /// All records of a server ordered by unit, block type and address.
    async fn find_all(&self, server_id: &str) -> Result<Vec<RegisterRecord>, ServerError>;

    async fn delete_all(&self, server_id: &str) -> Result<usize, ServerError>;

    /// Store records as given, dates included. With `replace` the server's
    /// existing records are deleted first. Runs in one transaction where the
    /// store supports it; individual record failures are logged and skipped.
    async fn import(&self, server_id: &str, records: &[RegisterRecord], replace: bool) -> Result<usize, ServerError>;
}

/// Saves written registers as one record per word for a server.
#[derive(Clone)]
pub struct RegisterPersister {
    dao: Arc<dyn RegisterDao>,
    server_id: String,
}

impl RegisterPersister {
    pub fn new(dao: Arc<dyn RegisterDao>, server_id: &str) -> Self {
        Self {
            dao,
            server_id: server_id.to_string(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Persist each word separately, all stamped with the same time. Returns
    /// the number saved; failures are logged and do not stop the batch.
    pub async fn save_words(&self, unit_id: u8, block_type: RegisterBlockType, address: u16, words: &[u16]) -> usize {
        let now = record_timestamp();
        let mut saved = 0;
        for (i, word) in words.iter().enumerate() {
            let Some(addr) = address.checked_add(i as u16) else {
                break;
            };
            let record = RegisterRecord::new(&self.server_id, unit_id, block_type, addr, *word, now);
            match self.dao.save(&record).await {
                Ok(()) => saved += 1,
                Err(e) => error!(
                    "❌ Failed to persist {} register {} of unit {} for server {}: {}",
                    block_type, addr, unit_id, self.server_id, e
                ),
            }
        }
        debug!("Persisted {} of {} {} register(s) for unit {}", saved, words.len(), block_type, unit_id);
        saved
    }
}

#[async_trait]
impl RegisterWriteListener for RegisterPersister {
    async fn registers_written(&self, unit_id: u8, block_type: RegisterBlockType, address: u16, values: &[u16]) {
        self.save_words(unit_id, block_type, address, values).await;
    }
}
