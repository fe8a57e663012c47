use log::info;
use sqlx::SqlitePool;

use crate::utils::error::ServerError;

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), ServerError> {
        info!("🔄 Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY,
                version TEXT NOT NULL UNIQUE,
                applied_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| ServerError::Storage(format!("Failed to create migrations table: {}", e)))?;

        Self::apply_migration_v1(pool).await?;
        Self::apply_migration_v2(pool).await?;

        info!("All migrations completed");
        Ok(())
    }

    async fn is_applied(pool: &SqlitePool, version: &str) -> Result<bool, ServerError> {
        let exists: i64 = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM migrations WHERE version = ?)")
            .bind(version)
            .fetch_one(pool)
            .await?;
        Ok(exists != 0)
    }

    async fn record(pool: &SqlitePool, version: &str) -> Result<(), ServerError> {
        sqlx::query("INSERT INTO migrations (version) VALUES (?)")
            .bind(version)
            .execute(pool)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to record migration {}: {}", version, e)))?;
        Ok(())
    }

    async fn apply_migration_v1(pool: &SqlitePool) -> Result<(), ServerError> {
        if Self::is_applied(pool, "v1").await? {
            return Ok(());
        }
        info!("📦 Applying migration v1: Create register table");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS modbus_server_register (
                server_id TEXT NOT NULL,
                unit_id INTEGER NOT NULL,
                block_type TEXT NOT NULL,
                address INTEGER NOT NULL,
                created INTEGER NOT NULL,
                modified INTEGER NOT NULL,
                value INTEGER NOT NULL,
                PRIMARY KEY (server_id, unit_id, block_type, address)
            )
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| ServerError::Storage(format!("Failed to create register table: {}", e)))?;

        Self::record(pool, "v1").await
    }

    async fn apply_migration_v2(pool: &SqlitePool) -> Result<(), ServerError> {
        if Self::is_applied(pool, "v2").await? {
            return Ok(());
        }
        info!("📦 Applying migration v2: Add register modified index");

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_register_modified ON modbus_server_register(server_id, modified DESC)")
            .execute(pool)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to create register index: {}", e)))?;

        Self::record(pool, "v2").await
    }
}
