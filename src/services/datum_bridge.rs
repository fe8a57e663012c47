//! Turns captured measurement events into register writes.
//!
//! Event producers call [`MeasurementListener::on_measurement_captured`]; the
//! matching updates are queued to a worker task so the producer never waits on
//! register locks or persistence I/O.

use log::{debug, error, trace, warn};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::config::model::{MeasurementConfig, UnitConfig};
use crate::modbus::encoding::coerce_bit;
use crate::modbus::types::RegisterBlockType;
use crate::registers::RegisterStore;
use crate::storage::dao::RegisterPersister;
use crate::utils::error::ServerError;

/// Receives measurement-captured notifications from the monitoring pipeline.
pub trait MeasurementListener: Send + Sync {
    fn on_measurement_captured(&self, source_id: &str, samples: &Map<String, Value>);
}

/// Reports which operational modes are currently active.
pub trait OperationalModes: Send + Sync {
    fn is_mode_active(&self, mode: &str) -> bool;
}

/// One configured measurement matched by an event, ready to write.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementUpdate {
    pub unit_id: u8,
    pub block_type: RegisterBlockType,
    pub address: u16,
    pub measurement: MeasurementConfig,
    pub value: Value,
}

/// Match an event's samples against every configured measurement.
pub fn resolve_updates(units: &[UnitConfig], source_id: &str, samples: &Map<String, Value>) -> Vec<MeasurementUpdate> {
    let mut updates = Vec::new();
    for unit in units {
        for block in &unit.blocks {
            for (address, meas) in block.addressed_measurements() {
                if meas.source_id.as_deref() != Some(source_id) || address > u16::MAX as u32 {
                    continue;
                }
                let Some(value) = meas.property_name.as_deref().and_then(|p| samples.get(p)) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                updates.push(MeasurementUpdate {
                    unit_id: unit.unit_id,
                    block_type: block.block_type,
                    address: address as u16,
                    measurement: meas.clone(),
                    value: value.clone(),
                });
            }
        }
    }
    updates
}

/// Write one update into the store, returning the register values written
/// (`0`/`1` for bits).
pub fn apply_update(store: &RegisterStore, update: &MeasurementUpdate) -> Result<Vec<u16>, ServerError> {
    let unit = store.unit(update.unit_id);
    if update.block_type.is_bit_type() {
        let bit = coerce_bit(&update.value);
        unit.write_bit(update.block_type, update.address, bit)?;
        return Ok(vec![bit as u16]);
    }
    let meas = &update.measurement;
    let value = meas.apply_transforms(&update.value);
    unit.write_value(update.block_type, meas.data_type, update.address, meas.size(), &value)
}

/// Apply updates in order, persisting each written word when a persister is
/// given. Failures are logged and do not stop the batch.
pub async fn apply_updates(store: &RegisterStore, updates: &[MeasurementUpdate], persister: Option<&RegisterPersister>) {
    for update in updates {
        match apply_update(store, update) {
            Ok(words) => {
                trace!(
                    "Unit {} {} {} = {} -> {:04X?}",
                    update.unit_id,
                    update.block_type,
                    update.address,
                    update.value,
                    words
                );
                if let Some(persister) = persister {
                    persister
                        .save_words(update.unit_id, update.block_type, update.address, &words)
                        .await;
                }
            }
            Err(e) => warn!(
                "Unable to write {} to unit {} {} register {}: {}",
                update.value, update.unit_id, update.block_type, update.address, e
            ),
        }
    }
}

enum BridgeMessage {
    Apply {
        updates: Vec<MeasurementUpdate>,
        persister: Option<RegisterPersister>,
    },
    Flush(oneshot::Sender<()>),
}

/// Queue feeding a single worker that applies updates to a register store.
#[derive(Clone)]
pub struct DatumBridge {
    tx: mpsc::UnboundedSender<BridgeMessage>,
}

impl DatumBridge {
    /// Start the worker task. Must be called within a Tokio runtime.
    pub fn spawn(store: RegisterStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    BridgeMessage::Apply { updates, persister } => {
                        apply_updates(&store, &updates, persister.as_ref()).await;
                    }
                    BridgeMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Datum bridge worker finished");
        });
        Self { tx }
    }

    pub fn submit(&self, updates: Vec<MeasurementUpdate>, persister: Option<RegisterPersister>) -> Result<(), ServerError> {
        if updates.is_empty() {
            return Ok(());
        }
        self.tx
            .send(BridgeMessage::Apply { updates, persister })
            .map_err(|_| {
                error!("Datum bridge worker is gone; dropping measurement updates");
                ServerError::NotRunning
            })
    }

    /// Wait until everything submitted so far has been applied.
    pub async fn flush(&self) -> Result<(), ServerError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(BridgeMessage::Flush(done))
            .map_err(|_| ServerError::NotRunning)?;
        wait.await.map_err(|_| ServerError::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::RegisterBlockConfig;
    use crate::modbus::types::ModbusDataType;
    use crate::storage::dao::RegisterDao;
    use crate::storage::memory::MemoryRegisterDao;
    use crate::storage::models::RegisterRecord;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    fn units() -> Vec<UnitConfig> {
        vec![
            UnitConfig::new(1)
                .with_block(
                    RegisterBlockConfig::new(RegisterBlockType::Holding, 0)
                        .with_measurement(MeasurementConfig::new("meter/1", "watts", ModbusDataType::Int16))
                        .with_measurement(MeasurementConfig::new("meter/1", "energy", ModbusDataType::UInt32))
                        .with_measurement(
                            MeasurementConfig::new("meter/1", "current", ModbusDataType::UInt16)
                                .with_multiplier(10.0),
                        ),
                )
                .with_block(
                    RegisterBlockConfig::new(RegisterBlockType::Coil, 4)
                        .with_measurement(MeasurementConfig::new("relay/1", "on", ModbusDataType::Boolean)),
                ),
            UnitConfig::new(2).with_block(
                RegisterBlockConfig::new(RegisterBlockType::Input, 100)
                    .with_measurement(MeasurementConfig::new("meter/1", "watts", ModbusDataType::Int16)),
            ),
        ]
    }

    fn samples(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_resolve_fans_out_across_units() {
        let updates = resolve_updates(&units(), "meter/1", &samples(json!({"watts": 1500, "voltage": 230})));
        assert_eq!(updates.len(), 2);
        assert_eq!((updates[0].unit_id, updates[0].address), (1, 0));
        assert_eq!(
            (updates[1].unit_id, updates[1].block_type, updates[1].address),
            (2, RegisterBlockType::Input, 100)
        );
    }

    #[test]
    fn test_resolve_skips_nulls_and_other_sources() {
        assert!(resolve_updates(&units(), "meter/1", &samples(json!({"watts": null}))).is_empty());
        assert!(resolve_updates(&units(), "meter/2", &samples(json!({"watts": 5}))).is_empty());
    }

    #[test]
    fn test_apply_words_and_bits() {
        let store = RegisterStore::new();
        let updates = resolve_updates(
            &units(),
            "meter/1",
            &samples(json!({"watts": 1500, "energy": 70000, "current": 1.25})),
        );
        for update in &updates {
            apply_update(&store, update).unwrap();
        }
        assert_eq!(
            store.read_words(1, RegisterBlockType::Holding, 0, 4).unwrap(),
            vec![1500, 0x0001, 0x1170, 13]
        );

        let relay = resolve_updates(&units(), "relay/1", &samples(json!({"on": "yes"})));
        assert_eq!(apply_update(&store, &relay[0]).unwrap(), vec![1]);
        assert_eq!(store.read_bits(1, RegisterBlockType::Coil, 4, 1).unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_bridge_persists_each_word() {
        let store = RegisterStore::new();
        let dao = Arc::new(MemoryRegisterDao::new());
        let persister = RegisterPersister::new(dao.clone(), "srv");
        let bridge = DatumBridge::spawn(store.clone());

        let updates = resolve_updates(&units(), "meter/1", &samples(json!({"energy": 70000})));
        bridge.submit(updates, Some(persister)).unwrap();
        bridge.flush().await.unwrap();

        let records = dao.find_all("srv").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].address, records[0].value), (1, 0x0001));
        assert_eq!((records[1].address, records[1].value), (2, 0x1170));
        assert_eq!(records[0].modified, records[1].modified);
    }

    struct FailingDao {
        inner: MemoryRegisterDao,
        fail_address: u16,
    }

    #[async_trait]
    impl RegisterDao for FailingDao {
        async fn save(&self, record: &RegisterRecord) -> Result<(), ServerError> {
            if record.address == self.fail_address {
                return Err(ServerError::Storage("disk full".to_string()));
            }
            self.inner.save(record).await
        }

        async fn find_all(&self, server_id: &str) -> Result<Vec<RegisterRecord>, ServerError> {
            self.inner.find_all(server_id).await
        }

        async fn delete_all(&self, server_id: &str) -> Result<usize, ServerError> {
            self.inner.delete_all(server_id).await
        }

        async fn import(&self, server_id: &str, records: &[RegisterRecord], replace: bool) -> Result<usize, ServerError> {
            self.inner.import(server_id, records, replace).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_stop_batch() {
        let store = RegisterStore::new();
        let dao = Arc::new(FailingDao {
            inner: MemoryRegisterDao::new(),
            fail_address: 1,
        });
        let persister = RegisterPersister::new(dao.clone(), "srv");

        let updates = resolve_updates(
            &units(),
            "meter/1",
            &samples(json!({"watts": 10, "energy": 70000, "current": 2})),
        );
        apply_updates(&store, &updates, Some(&persister)).await;

        let addresses: Vec<u16> = dao
            .find_all("srv")
            .await
            .unwrap()
            .iter()
            .filter(|r| r.unit_id == 1)
            .map(|r| r.address)
            .collect();
        assert_eq!(addresses, vec![0, 2, 3]);
        assert_eq!(store.read_words(1, RegisterBlockType::Holding, 3, 1).unwrap(), vec![20]);
    }
}
