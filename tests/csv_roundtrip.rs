use std::fs;
use tempfile::TempDir;

use modbus_register_server::config::{parse_csv_files, write_csv, InstanceConfig};
use modbus_register_server::{MeasurementConfig, ModbusDataType, RegisterBlockConfig, RegisterBlockType, ServerConfig, UnitConfig};

const METERS_CSV: &str = "\
Instance ID,Bind Address,Port,Throttle,Unit ID,Register Type,Register Address,Data Type,Data Length,Source ID,Property,Multiplier,Decimal Scale
#param,uid,Meter Server,
#param,groupUid,Site A,
1,0.0.0.0,5020,50,1,Holding,0,s16,,meter/1,watts,,
,,,,,,,u32,,meter/1,wattHours,,
,,,,,,,f32,,meter/1,current,0.001,3
,,,,,Input,10,string,4,meter/1,name,,
,,,,2,Coil,0,bit,,relay/1,on,,
-,127.0.0.1,1502,,3,Holding,100,u16,,meter/2,watts,,
";

#[test]
fn test_import_multiple_instances() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("meters.csv");
    fs::write(&path, METERS_CSV).unwrap();

    let import = parse_csv_files(&[path]);
    assert!(import.messages.is_empty(), "{:?}", import.messages);
    assert_eq!(import.instances.len(), 2);

    let first = &import.instance("1").unwrap().config;
    assert_eq!(first.uid.as_deref(), Some("Meter Server"));
    assert_eq!(first.meta.get("groupUid").map(String::as_str), Some("Site A"));
    assert_eq!((first.port, first.request_throttle_ms), (5020, 50));

    let unit1 = first.unit(1).unwrap();
    assert_eq!(unit1.blocks.len(), 2);
    assert_eq!(unit1.blocks[0].block_type, RegisterBlockType::Holding);
    assert_eq!(unit1.blocks[0].measurements.len(), 3);
    assert_eq!(unit1.blocks[0].end_address(), 5);
    assert_eq!((unit1.blocks[1].block_type, unit1.blocks[1].start_address), (RegisterBlockType::Input, 10));
    assert_eq!(unit1.blocks[1].measurements[0].size(), 4);
    assert_eq!(first.unit(2).unwrap().blocks[0].block_type, RegisterBlockType::Coil);

    let second = &import.instance("2").unwrap().config;
    assert_eq!(second.bind_address, "127.0.0.1");
    assert_eq!(second.unit(3).unwrap().blocks[0].start_address, 100);
}

#[test]
fn test_bad_file_does_not_spoil_good_ones() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.csv");
    fs::write(&good, METERS_CSV).unwrap();
    let missing = dir.path().join("missing.csv");

    let import = parse_csv_files(&[missing, good]);
    assert_eq!(import.instances.len(), 2);
    assert_eq!(import.messages.len(), 1);
    assert!(import.messages[0].contains("missing.csv"));
}

#[test]
fn test_export_import_round_trip() {
    let config = ServerConfig {
        uid: Some("Inverter Server".to_string()),
        port: 1502,
        allow_writes: true,
        units: vec![
            UnitConfig::new(1)
                .with_block(
                    RegisterBlockConfig::new(RegisterBlockType::Input, 0)
                        .with_measurement(MeasurementConfig::new("inv/1", "watts", ModbusDataType::Float32))
                        .with_measurement(MeasurementConfig::new("inv/1", "wattHours", ModbusDataType::UInt64))
                        .with_measurement(
                            MeasurementConfig::new("inv/1", "voltage", ModbusDataType::UInt16)
                                .with_multiplier(10.0)
                                .with_decimal_scale(-1),
                        ),
                )
                .with_block(
                    RegisterBlockConfig::new(RegisterBlockType::Input, 50)
                        .with_measurement(MeasurementConfig::new("inv/1", "serial", ModbusDataType::Bytes).with_word_length(3)),
                )
                .with_block(
                    RegisterBlockConfig::new(RegisterBlockType::Discrete, 7)
                        .with_measurement(MeasurementConfig::new("inv/1", "fault", ModbusDataType::Boolean)),
                ),
            UnitConfig::new(2).with_block(
                RegisterBlockConfig::new(RegisterBlockType::Holding, 200)
                    .with_measurement(MeasurementConfig::new("inv/2", "limit", ModbusDataType::Int32)),
            ),
        ],
        ..Default::default()
    };
    let instances = vec![InstanceConfig {
        key: "1".to_string(),
        config,
    }];

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("export.csv");
    write_csv(fs::File::create(&path).unwrap(), &instances).unwrap();

    let import = parse_csv_files(&[path]);
    assert!(import.messages.is_empty(), "{:?}", import.messages);
    assert_eq!(import.instances, instances);
}

#[cfg(feature = "sqlite")]
mod backup {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    use modbus_register_server::config::SqliteConfig;
    use modbus_register_server::storage::{RegisterBackupService, SqliteManager};
    use modbus_register_server::{RegisterDao, RegisterRecord};

    async fn database(dir: &TempDir, name: &str) -> SqliteManager {
        SqliteManager::new(SqliteConfig {
            database_path: dir.path().join(name).to_string_lossy().to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_backup_restore_between_databases() {
        let dir = TempDir::new().unwrap();
        let source = database(&dir, "source.db").await;
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let modified = Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap();
        for (unit, block, address, value) in [
            (1u8, RegisterBlockType::Holding, 0u16, 0x05DCu16),
            (1, RegisterBlockType::Holding, 1, 0xFFFF),
            (1, RegisterBlockType::Coil, 3, 1),
            (4, RegisterBlockType::Input, 20, 0x0042),
        ] {
            let mut record = RegisterRecord::new("srv", unit, block, address, value, created);
            record.modified = modified;
            source.save(&record).await.unwrap();
        }
        source
            .save(&RegisterRecord::new("elsewhere", 1, RegisterBlockType::Holding, 0, 7, created))
            .await
            .unwrap();

        let csv_path = dir.path().join("backup.csv");
        let exported = RegisterBackupService::new(Arc::new(source.clone()))
            .export_csv("srv", fs::File::create(&csv_path).unwrap())
            .await
            .unwrap();
        assert_eq!(exported, 4);

        let target = database(&dir, "target.db").await;
        target
            .save(&RegisterRecord::new("srv", 9, RegisterBlockType::Holding, 9, 9, created))
            .await
            .unwrap();
        let result = RegisterBackupService::new(Arc::new(target.clone()))
            .import_csv("srv", fs::File::open(&csv_path).unwrap(), true)
            .await
            .unwrap();
        assert_eq!(result.imported, 4);
        assert!(result.messages.is_empty());

        assert_eq!(
            target.find_all("srv").await.unwrap(),
            source.find_all("srv").await.unwrap()
        );
        source.close().await;
        target.close().await;
    }
}
