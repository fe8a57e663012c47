use log::trace;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use crate::modbus::encoding::{decode_value, encode_value};
use crate::modbus::types::{ModbusDataType, RegisterBlockType};
use crate::utils::error::ServerError;

/// Register memory for a single Modbus unit.
///
/// The four blocks are independent namespaces, each behind its own lock.
/// Memory is sparse: anything never written reads back as zero.
#[derive(Debug, Default)]
pub struct RegisterAddressSpace {
    coils: RwLock<BTreeSet<u16>>,
    discretes: RwLock<BTreeSet<u16>>,
    holdings: RwLock<BTreeMap<u16, u16>>,
    inputs: RwLock<BTreeMap<u16, u16>>,
}

fn check_range(start: u16, count: usize) -> Result<(), ServerError> {
    if start as usize + count > 0x1_0000 {
        return Err(ServerError::InvalidData(format!(
            "Address range {} + {} exceeds the register address space",
            start, count
        )));
    }
    Ok(())
}

impl RegisterAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn bits(&self, block_type: RegisterBlockType) -> Result<&RwLock<BTreeSet<u16>>, ServerError> {
        match block_type {
            RegisterBlockType::Coil => Ok(&self.coils),
            RegisterBlockType::Discrete => Ok(&self.discretes),
            other => Err(ServerError::InvalidData(format!("{} is not a bit block", other))),
        }
    }

    fn words(&self, block_type: RegisterBlockType) -> Result<&RwLock<BTreeMap<u16, u16>>, ServerError> {
        match block_type {
            RegisterBlockType::Holding => Ok(&self.holdings),
            RegisterBlockType::Input => Ok(&self.inputs),
            other => Err(ServerError::InvalidData(format!("{} is not a register block", other))),
        }
    }

    pub fn read_bits(&self, block_type: RegisterBlockType, start: u16, count: u16) -> Result<Vec<bool>, ServerError> {
        check_range(start, count as usize)?;
        let bits = self.bits(block_type)?.read().map_err(|_| ServerError::LockError)?;
        Ok((0..count).map(|i| bits.contains(&(start + i))).collect())
    }

    pub fn write_bit(&self, block_type: RegisterBlockType, address: u16, value: bool) -> Result<(), ServerError> {
        self.write_bits(block_type, address, &[value])
    }

    pub fn write_bits(&self, block_type: RegisterBlockType, start: u16, values: &[bool]) -> Result<(), ServerError> {
        check_range(start, values.len())?;
        let mut bits = self.bits(block_type)?.write().map_err(|_| ServerError::LockError)?;
        for (i, value) in values.iter().enumerate() {
            let address = start + i as u16;
            if *value {
                bits.insert(address);
            } else {
                bits.remove(&address);
            }
        }
        trace!("Wrote {} {} bit(s) at {}", values.len(), block_type, start);
        Ok(())
    }

    pub fn read_words(&self, block_type: RegisterBlockType, start: u16, count: u16) -> Result<Vec<u16>, ServerError> {
        check_range(start, count as usize)?;
        let words = self.words(block_type)?.read().map_err(|_| ServerError::LockError)?;
        Ok((0..count)
            .map(|i| words.get(&(start + i)).copied().unwrap_or(0))
            .collect())
    }

    /// Write a run of words under a single lock so readers never observe a
    /// partially written multi-word value.
    pub fn write_words(&self, block_type: RegisterBlockType, start: u16, values: &[u16]) -> Result<(), ServerError> {
        check_range(start, values.len())?;
        let mut words = self.words(block_type)?.write().map_err(|_| ServerError::LockError)?;
        for (i, value) in values.iter().enumerate() {
            words.insert(start + i as u16, *value);
        }
        trace!("Wrote {} {} register(s) at {}", values.len(), block_type, start);
        Ok(())
    }

    /// Encode and store a typed value, returning the words written.
    pub fn write_value(
        &self,
        block_type: RegisterBlockType,
        data_type: ModbusDataType,
        address: u16,
        size: u16,
        value: &Value,
    ) -> Result<Vec<u16>, ServerError> {
        let words = encode_value(data_type, value, size)?;
        self.write_words(block_type, address, &words)?;
        Ok(words)
    }

    pub fn read_value(
        &self,
        block_type: RegisterBlockType,
        data_type: ModbusDataType,
        address: u16,
        size: u16,
    ) -> Result<Value, ServerError> {
        if block_type.is_bit_type() {
            let bits = self.read_bits(block_type, address, 1)?;
            return Ok(Value::Bool(bits[0]));
        }
        let words = self.read_words(block_type, address, size)?;
        decode_value(data_type, &words)
    }

    /// Set bit addresses of a bit block, in ascending order.
    pub fn set_bits(&self, block_type: RegisterBlockType) -> Result<Vec<u16>, ServerError> {
        let bits = self.bits(block_type)?.read().map_err(|_| ServerError::LockError)?;
        Ok(bits.iter().copied().collect())
    }

    /// Every register ever written to a word block, in ascending address order.
    pub fn written_words(&self, block_type: RegisterBlockType) -> Result<Vec<(u16, u16)>, ServerError> {
        let words = self.words(block_type)?.read().map_err(|_| ServerError::LockError)?;
        Ok(words.iter().map(|(a, v)| (*a, *v)).collect())
    }

    pub fn clear(&self) -> Result<(), ServerError> {
        self.coils.write().map_err(|_| ServerError::LockError)?.clear();
        self.discretes.write().map_err(|_| ServerError::LockError)?.clear();
        self.holdings.write().map_err(|_| ServerError::LockError)?.clear();
        self.inputs.write().map_err(|_| ServerError::LockError)?.clear();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        let bits_empty = |l: &RwLock<BTreeSet<u16>>| l.read().map(|b| b.is_empty()).unwrap_or(true);
        let words_empty = |l: &RwLock<BTreeMap<u16, u16>>| l.read().map(|w| w.is_empty()).unwrap_or(true);
        bits_empty(&self.coils)
            && bits_empty(&self.discretes)
            && words_empty(&self.holdings)
            && words_empty(&self.inputs)
    }
}
