use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

use super::dao::RegisterDao;
use super::migrations::DatabaseMigrations;
use super::models::RegisterRecord;
use crate::config::settings::SqliteConfig;
use crate::modbus::types::RegisterBlockType;
use crate::utils::error::ServerError;

const UPSERT_VALUE_SQL: &str = r#"
    INSERT INTO modbus_server_register (
        server_id, unit_id, block_type, address, created, modified, value
    ) VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (server_id, unit_id, block_type, address)
    DO UPDATE SET modified = excluded.modified, value = excluded.value
"#;

const UPSERT_RECORD_SQL: &str = r#"
    INSERT INTO modbus_server_register (
        server_id, unit_id, block_type, address, created, modified, value
    ) VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (server_id, unit_id, block_type, address)
    DO UPDATE SET created = excluded.created, modified = excluded.modified, value = excluded.value
"#;

#[derive(Clone)]
pub struct SqliteManager {
    pool: SqlitePool,
    config: SqliteConfig,
}

impl SqliteManager {
    pub async fn new(config: SqliteConfig) -> Result<Self, ServerError> {
        if let Some(parent) = Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ServerError::Storage(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        info!("🗄️  Initializing SQLite database: {}", config.database_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&config.database_path)
                    .create_if_missing(true)
                    .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
                    .journal_mode(if config.enable_wal {
                        SqliteJournalMode::Wal
                    } else {
                        SqliteJournalMode::Delete
                    })
                    .synchronous(SqliteSynchronous::Normal),
            )
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to connect to SQLite: {}", e)))?;

        DatabaseMigrations::run_migrations(&pool).await?;

        info!("✅ SQLite database initialized successfully");
        Ok(Self { pool, config })
    }

    pub fn database_path(&self) -> &str {
        &self.config.database_path
    }

    pub async fn count(&self, server_id: &str) -> Result<i64, ServerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM modbus_server_register WHERE server_id = ?")
            .bind(server_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        info!("🔒 Closing SQLite database connections");
        self.pool.close().await;
    }
}

fn bind_record<'q>(
    sql: &'q str,
    record: &'q RegisterRecord,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(sql)
        .bind(record.server_id.as_str())
        .bind(record.unit_id as i64)
        .bind(record.block_type.name())
        .bind(record.address as i64)
        .bind(record.created.timestamp_millis())
        .bind(record.modified.timestamp_millis())
        .bind(record.value as i64)
}

fn record_from_row(row: &SqliteRow) -> Result<RegisterRecord, ServerError> {
    let unit_id: i64 = row.try_get("unit_id")?;
    let block_type: String = row.try_get("block_type")?;
    let address: i64 = row.try_get("address")?;
    let created: i64 = row.try_get("created")?;
    let modified: i64 = row.try_get("modified")?;
    let value: i64 = row.try_get("value")?;

    Ok(RegisterRecord {
        server_id: row.try_get("server_id")?,
        unit_id: u8::try_from(unit_id)
            .map_err(|_| ServerError::Storage(format!("Unit ID {} out of range", unit_id)))?,
        block_type: block_type.parse::<RegisterBlockType>()?,
        address: u16::try_from(address)
            .map_err(|_| ServerError::Storage(format!("Register address {} out of range", address)))?,
        created: timestamp(created)?,
        modified: timestamp(modified)?,
        value: u16::try_from(value)
            .map_err(|_| ServerError::Storage(format!("Register value {} out of range", value)))?,
    })
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, ServerError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| ServerError::Storage(format!("Invalid timestamp {}", millis)))
}

#[async_trait]
impl RegisterDao for SqliteManager {
    async fn save(&self, record: &RegisterRecord) -> Result<(), ServerError> {
        bind_record(UPSERT_VALUE_SQL, record).execute(&self.pool).await?;
        Ok(())
    }

    async fn find_all(&self, server_id: &str) -> Result<Vec<RegisterRecord>, ServerError> {
        let rows = sqlx::query(
            r#"
            SELECT server_id, unit_id, block_type, address, created, modified, value
            FROM modbus_server_register
            WHERE server_id = ?
            ORDER BY unit_id, block_type, address
        "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn delete_all(&self, server_id: &str) -> Result<usize, ServerError> {
        let result = sqlx::query("DELETE FROM modbus_server_register WHERE server_id = ?")
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn import(&self, server_id: &str, records: &[RegisterRecord], replace: bool) -> Result<usize, ServerError> {
        let mut tx = self.pool.begin().await?;

        if replace {
            let deleted = sqlx::query("DELETE FROM modbus_server_register WHERE server_id = ?")
                .bind(server_id)
                .execute(&mut *tx)
                .await?;
            debug!("Deleted {} register(s) of server {} before import", deleted.rows_affected(), server_id);
        }

        let mut imported = 0;
        for record in records {
            match bind_record(UPSERT_RECORD_SQL, record).execute(&mut *tx).await {
                Ok(_) => imported += 1,
                Err(e) => error!(
                    "❌ Failed to import {} register {} of unit {}: {}",
                    record.block_type, record.address, record.unit_id, e
                ),
            }
        }

        tx.commit().await?;
        info!("💾 Imported {} register(s) for server {}", imported, server_id);
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::record_timestamp;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> SqliteManager {
        let config = SqliteConfig {
            database_path: dir.path().join("registers.db").to_string_lossy().to_string(),
            ..Default::default()
        };
        SqliteManager::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_keeps_created() {
        let dir = TempDir::new().unwrap();
        let db = manager(&dir).await;
        let t0 = record_timestamp();
        let t1 = t0 + chrono::Duration::seconds(10);

        db.save(&RegisterRecord::new("srv", 1, RegisterBlockType::Holding, 7, 0x00FF, t0))
            .await
            .unwrap();
        db.save(&RegisterRecord::new("srv", 1, RegisterBlockType::Holding, 7, 0x0100, t1))
            .await
            .unwrap();

        let records = db.find_all("srv").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 0x0100);
        assert_eq!(records[0].created, t0);
        assert_eq!(records[0].modified, t1);
        assert_eq!(db.count("srv").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_value_is_rejected() {
        let dir = TempDir::new().unwrap();
        let db = manager(&dir).await;
        sqlx::query(
            "INSERT INTO modbus_server_register (server_id, unit_id, block_type, address, created, modified, value) \
             VALUES ('srv', 1, 'Holding', 0, 0, 0, 70000)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        assert!(matches!(db.find_all("srv").await, Err(ServerError::Storage(_))));
    }

    #[tokio::test]
    async fn test_import_replace() {
        let dir = TempDir::new().unwrap();
        let db = manager(&dir).await;
        let now = record_timestamp();

        db.save(&RegisterRecord::new("srv", 1, RegisterBlockType::Coil, 0, 1, now))
            .await
            .unwrap();
        db.save(&RegisterRecord::new("other", 1, RegisterBlockType::Coil, 0, 1, now))
            .await
            .unwrap();

        let records = vec![
            RegisterRecord::new("srv", 2, RegisterBlockType::Input, 10, 0xFFFF, now),
            RegisterRecord::new("srv", 2, RegisterBlockType::Discrete, 3, 1, now),
        ];
        assert_eq!(db.import("srv", &records, true).await.unwrap(), 2);

        let stored = db.find_all("srv").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].block_type, RegisterBlockType::Discrete);
        assert_eq!(stored[1].value, 0xFFFF);
        assert_eq!(db.find_all("other").await.unwrap().len(), 1);
        db.close().await;
    }
}
