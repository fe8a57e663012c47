use dashmap::DashMap;
use log::info;
use std::fmt::Write as _;
use std::sync::Arc;

use super::address_space::RegisterAddressSpace;
use crate::modbus::types::RegisterBlockType;
use crate::utils::error::ServerError;

/// Register memory for every unit ID served by one server instance.
///
/// Units are created lazily on first reference. Cloning shares the same memory.
#[derive(Clone, Default)]
pub struct RegisterStore {
    units: Arc<DashMap<u8, Arc<RegisterAddressSpace>>>,
}

impl RegisterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address space for `unit_id`, created on first use.
    pub fn unit(&self, unit_id: u8) -> Arc<RegisterAddressSpace> {
        self.units.entry(unit_id).or_default().value().clone()
    }

    /// Address space for `unit_id` only if it already exists.
    pub fn get(&self, unit_id: u8) -> Option<Arc<RegisterAddressSpace>> {
        self.units.get(&unit_id).map(|u| u.value().clone())
    }

    pub fn contains(&self, unit_id: u8) -> bool {
        self.units.contains_key(&unit_id)
    }

    pub fn unit_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.units.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Keep exactly `unit_ids`: create missing units and drop all others.
    pub fn sync_units(&self, unit_ids: &[u8]) {
        for id in unit_ids {
            self.unit(*id);
        }
        let removed: Vec<u8> = self
            .unit_ids()
            .into_iter()
            .filter(|id| !unit_ids.contains(id))
            .collect();
        for id in removed {
            self.units.remove(&id);
            info!("🧹 Removed register data for unconfigured unit {}", id);
        }
    }

    pub fn clear(&self) {
        self.units.clear();
    }

    pub fn read_bits(&self, unit_id: u8, block_type: RegisterBlockType, start: u16, count: u16) -> Result<Vec<bool>, ServerError> {
        self.unit(unit_id).read_bits(block_type, start, count)
    }

    pub fn read_words(&self, unit_id: u8, block_type: RegisterBlockType, start: u16, count: u16) -> Result<Vec<u16>, ServerError> {
        self.unit(unit_id).read_words(block_type, start, count)
    }

    pub fn write_bit(&self, unit_id: u8, block_type: RegisterBlockType, address: u16, value: bool) -> Result<(), ServerError> {
        self.unit(unit_id).write_bit(block_type, address, value)
    }

    pub fn write_words(&self, unit_id: u8, block_type: RegisterBlockType, address: u16, values: &[u16]) -> Result<(), ServerError> {
        self.unit(unit_id).write_words(block_type, address, values)
    }

    /// Human readable dump of every non-zero bit and written register.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for unit_id in self.unit_ids() {
            let Some(space) = self.get(unit_id) else {
                continue;
            };
            let _ = write!(out, "Unit ID: {}", unit_id);
            for (label, block_type) in [
                ("Coils", RegisterBlockType::Coil),
                ("Discrete Inputs", RegisterBlockType::Discrete),
            ] {
                if let Ok(bits) = space.set_bits(block_type) {
                    if !bits.is_empty() {
                        let list: Vec<String> = bits.iter().map(|b| b.to_string()).collect();
                        let _ = write!(out, "\n{}: {}", label, list.join(", "));
                    }
                }
            }
            for (label, block_type) in [
                ("Holding Registers", RegisterBlockType::Holding),
                ("Input Registers", RegisterBlockType::Input),
            ] {
                if let Ok(words) = space.written_words(block_type) {
                    if !words.is_empty() {
                        let _ = write!(out, "\n{}:", label);
                        for (address, value) in words {
                            let _ = write!(out, "\n  {}: 0x{:04X}", address, value);
                        }
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_are_created_lazily() {
        let store = RegisterStore::new();
        assert!(store.get(3).is_none());
        assert_eq!(store.read_words(3, RegisterBlockType::Holding, 0, 2).unwrap(), vec![0, 0]);
        assert!(store.contains(3));
    }

    #[test]
    fn test_sync_units() {
        let store = RegisterStore::new();
        store.write_words(1, RegisterBlockType::Holding, 0, &[1]).unwrap();
        store.write_words(9, RegisterBlockType::Holding, 0, &[9]).unwrap();
        store.sync_units(&[1, 2]);
        assert_eq!(store.unit_ids(), vec![1, 2]);
        assert_eq!(store.read_words(1, RegisterBlockType::Holding, 0, 1).unwrap(), vec![1]);
    }

    #[test]
    fn test_describe() {
        let store = RegisterStore::new();
        store.write_bit(1, RegisterBlockType::Coil, 3, true).unwrap();
        store.write_words(1, RegisterBlockType::Input, 7, &[0x00FF]).unwrap();
        let info = store.describe();
        assert!(info.contains("Unit ID: 1"));
        assert!(info.contains("Coils: 3"));
        assert!(info.contains("Input Registers:\n  7: 0x00FF"));
        assert!(!info.contains("Holding"));
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        let store = RegisterStore::new();
        let patterns: [[u16; 4]; 2] = [[0x1111; 4], [0x2222; 4]];
        let mut handles = Vec::new();
        for pattern in patterns {
            for _ in 0..4 {
                let store = store.clone();
                handles.push(std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        store.write_words(1, RegisterBlockType::Holding, 100, &pattern).unwrap();
                    }
                }));
            }
        }
        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let words = store.read_words(1, RegisterBlockType::Holding, 100, 4).unwrap();
                    assert!(words.iter().all(|w| *w == words[0]), "torn read: {:?}", words);
                }
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        reader.join().unwrap();

        let final_words = store.read_words(1, RegisterBlockType::Holding, 100, 4).unwrap();
        assert!(patterns.iter().any(|p| p[..] == final_words[..]));
    }
}
