use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::Commands;
use crate::config::csv_parser::{parse_csv_files, InstanceConfig};
use crate::config::csv_writer::write_csv;
use crate::config::settings::ServerConfig;
use crate::services::{MeasurementListener, ModbusServer, TokioScheduler};

/// One line of an events file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapturedEvent {
    source_id: String,
    #[serde(default)]
    samples: Map<String, Value>,
}

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { config, events } => run_server(&config, events.as_deref()).await,
        Commands::ConfigExport { config, output } => export_config(&config, &output),
        Commands::ConfigImport { input, output_dir } => import_config(&input, &output_dir),
        Commands::Backup {
            database,
            server_id,
            output,
        } => backup(&database, &server_id, &output).await,
        Commands::Restore {
            database,
            server_id,
            input,
            replace,
        } => restore(&database, &server_id, &input, replace).await,
    }
}

async fn run_server(config_path: &Path, events: Option<&Path>) -> Result<()> {
    let config = ServerConfig::from_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    info!("📋 Loaded Modbus server configuration {}", config.description());

    let mut server = ModbusServer::new(config.clone()).with_scheduler(Arc::new(TokioScheduler));

    #[cfg(feature = "sqlite")]
    let database = match &config.sqlite {
        Some(sqlite) => {
            let db = crate::storage::SqliteManager::new(sqlite.clone()).await?;
            server = server.with_dao(Arc::new(db.clone()));
            Some(db)
        }
        None => None,
    };

    if let Err(e) = server.health_check() {
        error!("❌ {}", e);
    }

    server.restart().await?;

    let replay = events.map(|path| {
        let server = server.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            if let Err(e) = replay_events(&server, &path).await {
                error!("Event replay from {} failed: {:#}", path.display(), e);
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    if let Some(replay) = replay {
        replay.abort();
    }
    server.stop().await;
    debug!("Register data:\n{}", server.describe());

    #[cfg(feature = "sqlite")]
    if let Some(db) = database {
        db.close().await;
    }
    Ok(())
}

async fn replay_events(server: &ModbusServer, path: &Path) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut count = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<CapturedEvent>(line) {
            Ok(event) => {
                server.on_measurement_captured(&event.source_id, &event.samples);
                count += 1;
            }
            Err(e) => warn!("Skipping malformed event line: {}", e),
        }
    }
    server.flush_updates().await?;
    info!("Replayed {} measurement event(s) from {}", count, path.display());
    Ok(())
}

fn export_config(configs: &[PathBuf], output: &Path) -> Result<()> {
    let mut instances = Vec::with_capacity(configs.len());
    for (i, path) in configs.iter().enumerate() {
        let config = ServerConfig::from_file(path).with_context(|| format!("Failed to load {}", path.display()))?;
        instances.push(InstanceConfig {
            key: (i + 1).to_string(),
            config,
        });
    }

    let file = File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
    write_csv(file, &instances)?;
    info!("📤 Exported {} server configuration(s) to {}", instances.len(), output.display());
    Ok(())
}

fn import_config(inputs: &[PathBuf], output_dir: &Path) -> Result<()> {
    let import = parse_csv_files(inputs);
    for message in &import.messages {
        warn!("{}", message);
    }

    std::fs::create_dir_all(output_dir)?;
    let mut saved = 0;
    for instance in &import.instances {
        let path = output_dir.join(format!("modbus-server-{}.toml", instance.key));
        match instance.config.validate().and_then(|_| instance.config.save_to_file(&path)) {
            Ok(()) => {
                info!("💾 Saved instance {} to {}", instance.key, path.display());
                saved += 1;
            }
            Err(e) => error!("Instance {} not saved: {}", instance.key, e),
        }
    }
    info!(
        "📥 Imported {} of {} server configuration(s) with {} message(s)",
        saved,
        import.instances.len(),
        import.messages.len()
    );
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_database(database: &Path) -> Result<crate::storage::SqliteManager> {
    let config = crate::config::settings::SqliteConfig {
        database_path: database.to_string_lossy().to_string(),
        ..Default::default()
    };
    Ok(crate::storage::SqliteManager::new(config).await?)
}

#[cfg(feature = "sqlite")]
async fn backup(database: &Path, server_id: &str, output: &Path) -> Result<()> {
    let db = open_database(database).await?;
    let service = crate::storage::RegisterBackupService::new(Arc::new(db.clone()));
    let file = File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
    let count = service.export_csv(server_id, file).await?;
    println!("✅ Exported {} register(s) to {}", count, output.display());
    db.close().await;
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn restore(database: &Path, server_id: &str, input: &Path, replace: bool) -> Result<()> {
    let db = open_database(database).await?;
    let service = crate::storage::RegisterBackupService::new(Arc::new(db.clone()));
    let file = File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    let result = service.import_csv(server_id, file, replace).await?;
    for message in &result.messages {
        println!("⚠️  {}", message);
    }
    println!("✅ Imported {} register(s) from {}", result.imported, input.display());
    db.close().await;
    Ok(())
}

#[cfg(not(feature = "sqlite"))]
async fn backup(_database: &Path, _server_id: &str, _output: &Path) -> Result<()> {
    anyhow::bail!("Register backup requires the sqlite feature")
}

#[cfg(not(feature = "sqlite"))]
async fn restore(_database: &Path, _server_id: &str, _input: &Path, _replace: bool) -> Result<()> {
    anyhow::bail!("Register restore requires the sqlite feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{MeasurementConfig, RegisterBlockConfig, UnitConfig};
    use crate::modbus::types::{ModbusDataType, RegisterBlockType};
    use tempfile::TempDir;

    #[test]
    fn test_event_line_format() {
        let event: CapturedEvent =
            serde_json::from_str(r#"{"sourceId": "meter/1", "samples": {"watts": 1500}}"#).unwrap();
        assert_eq!(event.source_id, "meter/1");
        assert_eq!(event.samples.get("watts"), Some(&Value::from(1500)));
    }

    #[test]
    fn test_config_export_then_import() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            uid: Some("Meter Server".to_string()),
            port: 1502,
            units: vec![UnitConfig::new(3).with_block(
                RegisterBlockConfig::new(RegisterBlockType::Input, 20)
                    .with_measurement(MeasurementConfig::new("meter/1", "watts", ModbusDataType::Float32)),
            )],
            ..Default::default()
        };
        let toml_path = dir.path().join("server.toml");
        config.save_to_file(&toml_path).unwrap();

        let csv_path = dir.path().join("servers.csv");
        export_config(&[toml_path], &csv_path).unwrap();

        let out = dir.path().join("out");
        import_config(&[csv_path], &out).unwrap();
        let imported = ServerConfig::from_file(out.join("modbus-server-1.toml")).unwrap();
        assert_eq!(imported, config);
    }
}
