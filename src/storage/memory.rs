use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::dao::RegisterDao;
use super::models::{RegisterKey, RegisterRecord};
use crate::utils::error::ServerError;

/// Register DAO kept in process memory, used when no database is configured
/// and in tests.
#[derive(Debug, Default)]
pub struct MemoryRegisterDao {
    records: Mutex<BTreeMap<RegisterKey, RegisterRecord>>,
}

impl MemoryRegisterDao {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RegisterDao for MemoryRegisterDao {
    async fn save(&self, record: &RegisterRecord) -> Result<(), ServerError> {
        let mut records = self.records.lock().map_err(|_| ServerError::LockError)?;
        records
            .entry(record.key())
            .and_modify(|existing| {
                existing.value = record.value;
                existing.modified = record.modified;
            })
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn find_all(&self, server_id: &str) -> Result<Vec<RegisterRecord>, ServerError> {
        let records = self.records.lock().map_err(|_| ServerError::LockError)?;
        Ok(records
            .values()
            .filter(|r| r.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn delete_all(&self, server_id: &str) -> Result<usize, ServerError> {
        let mut records = self.records.lock().map_err(|_| ServerError::LockError)?;
        let before = records.len();
        records.retain(|k, _| k.server_id != server_id);
        Ok(before - records.len())
    }

    async fn import(&self, server_id: &str, records: &[RegisterRecord], replace: bool) -> Result<usize, ServerError> {
        let mut stored = self.records.lock().map_err(|_| ServerError::LockError)?;
        if replace {
            stored.retain(|k, _| k.server_id != server_id);
        }
        for record in records {
            stored.insert(record.key(), record.clone());
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::types::RegisterBlockType;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_save_keeps_created_date() {
        let dao = MemoryRegisterDao::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        dao.save(&RegisterRecord::new("s1", 1, RegisterBlockType::Holding, 3, 10, t0))
            .await
            .unwrap();
        dao.save(&RegisterRecord::new("s1", 1, RegisterBlockType::Holding, 3, 20, t1))
            .await
            .unwrap();

        let records = dao.find_all("s1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 20);
        assert_eq!(records[0].created, t0);
        assert_eq!(records[0].modified, t1);
    }

    #[tokio::test]
    async fn test_records_are_scoped_by_server() {
        let dao = MemoryRegisterDao::new();
        let now = Utc::now();
        for server in ["a", "b"] {
            dao.save(&RegisterRecord::new(server, 1, RegisterBlockType::Coil, 0, 1, now))
                .await
                .unwrap();
        }
        assert_eq!(dao.delete_all("a").await.unwrap(), 1);
        assert!(dao.find_all("a").await.unwrap().is_empty());
        assert_eq!(dao.find_all("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_all_is_ordered() {
        let dao = MemoryRegisterDao::new();
        let now = Utc::now();
        let records = vec![
            RegisterRecord::new("s", 2, RegisterBlockType::Coil, 0, 1, now),
            RegisterRecord::new("s", 1, RegisterBlockType::Input, 5, 2, now),
            RegisterRecord::new("s", 1, RegisterBlockType::Holding, 9, 3, now),
            RegisterRecord::new("s", 1, RegisterBlockType::Holding, 1, 4, now),
        ];
        dao.import("s", &records, true).await.unwrap();
        let values: Vec<u16> = dao.find_all("s").await.unwrap().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![4, 3, 2, 1]);
    }
}
