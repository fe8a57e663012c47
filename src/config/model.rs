//! Unit → register block → measurement configuration tree.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::modbus::encoding::numeric_value;
use crate::modbus::types::{ModbusDataType, RegisterBlockType};
use crate::utils::error::ServerError;

pub const DEFAULT_WORD_LENGTH: u16 = 1;
pub const DEFAULT_UNIT_MULTIPLIER: f64 = 1.0;
pub const DEFAULT_DECIMAL_SCALE: i32 = 0;

/// Maps one named measurement property onto a fixed-width register encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    pub source_id: Option<String>,
    pub property_name: Option<String>,
    pub data_type: ModbusDataType,
    /// Register count for variable-length data types.
    pub word_length: u16,
    pub unit_multiplier: f64,
    /// Decimal places kept after scaling; negative disables rounding.
    pub decimal_scale: i32,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            source_id: None,
            property_name: None,
            data_type: ModbusDataType::default(),
            word_length: DEFAULT_WORD_LENGTH,
            unit_multiplier: DEFAULT_UNIT_MULTIPLIER,
            decimal_scale: DEFAULT_DECIMAL_SCALE,
        }
    }
}

impl MeasurementConfig {
    pub fn new(source_id: &str, property_name: &str, data_type: ModbusDataType) -> Self {
        Self {
            source_id: Some(source_id.to_string()),
            property_name: Some(property_name.to_string()),
            data_type,
            ..Default::default()
        }
    }

    pub fn with_word_length(mut self, word_length: u16) -> Self {
        self.word_length = word_length;
        self
    }

    pub fn with_multiplier(mut self, unit_multiplier: f64) -> Self {
        self.unit_multiplier = unit_multiplier;
        self
    }

    pub fn with_decimal_scale(mut self, decimal_scale: i32) -> Self {
        self.decimal_scale = decimal_scale;
        self
    }

    /// Number of registers (or bits) this measurement occupies.
    pub fn size(&self) -> u16 {
        match self.data_type.word_length() {
            0 => self.word_length.max(1),
            len => len,
        }
    }

    pub fn is_valid(&self) -> bool {
        let present = |s: &Option<String>| s.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false);
        present(&self.source_id) && present(&self.property_name)
    }

    pub fn matches(&self, source_id: &str, property_name: &str) -> bool {
        self.source_id.as_deref() == Some(source_id) && self.property_name.as_deref() == Some(property_name)
    }

    /// `{sourceId}/{propertyName}` identifier used for control instructions.
    pub fn control_id(&self) -> Option<String> {
        match (&self.source_id, &self.property_name) {
            (Some(s), Some(p)) if self.is_valid() => Some(format!("{}/{}", s, p)),
            _ => None,
        }
    }

    /// Apply the unit multiplier then decimal rounding to a numeric value.
    /// Integers pass through untouched unless a multiplier other than 1 applies.
    pub fn apply_transforms(&self, value: &Value) -> Value {
        let Value::Number(n) = value else {
            return value.clone();
        };
        let mut scaled = n.clone();
        if self.unit_multiplier != 1.0 {
            if let Some(v) = n.as_f64().and_then(|f| Number::from_f64(f * self.unit_multiplier)) {
                scaled = v;
            }
        }
        if self.decimal_scale >= 0 && scaled.is_f64() {
            if let Some(v) = scaled
                .as_f64()
                .and_then(|f| Number::from_f64(round_half_up(f, self.decimal_scale)))
            {
                scaled = v;
            }
        }
        Value::Number(scaled)
    }

    /// Inverse of the unit multiplier, for reading a register value back.
    pub fn reverse_transforms(&self, value: &Value) -> Value {
        if self.unit_multiplier == 1.0 || self.unit_multiplier == 0.0 {
            return value.clone();
        }
        match numeric_value(value).and_then(|f| Number::from_f64(f / self.unit_multiplier)) {
            Some(n) => Value::Number(n),
            None => value.clone(),
        }
    }
}

/// Round half away from zero to `scale` decimal places.
fn round_half_up(value: f64, scale: i32) -> f64 {
    let factor = 10f64.powi(scale);
    let rounded = (value * factor).round() / factor;
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

/// A contiguous run of measurements in one block type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterBlockConfig {
    pub block_type: RegisterBlockType,
    #[serde(default)]
    pub start_address: u16,
    #[serde(default)]
    pub measurements: Vec<MeasurementConfig>,
}

impl RegisterBlockConfig {
    pub fn new(block_type: RegisterBlockType, start_address: u16) -> Self {
        Self {
            block_type,
            start_address,
            measurements: Vec::new(),
        }
    }

    pub fn with_measurement(mut self, measurement: MeasurementConfig) -> Self {
        self.measurements.push(measurement);
        self
    }

    /// Measurements paired with their register address, each following the
    /// previous one's end.
    pub fn addressed_measurements(&self) -> impl Iterator<Item = (u32, &MeasurementConfig)> {
        let mut address = self.start_address as u32;
        self.measurements.iter().map(move |m| {
            let current = address;
            address += m.size() as u32;
            (current, m)
        })
    }

    /// One past the last address used by this block.
    pub fn end_address(&self) -> u32 {
        self.start_address as u32 + self.measurements.iter().map(|m| m.size() as u32).sum::<u32>()
    }

    pub fn covers(&self, block_type: RegisterBlockType, start: u16, count: u16) -> bool {
        block_type == self.block_type
            && start as u32 >= self.start_address as u32
            && start as u32 + count as u32 <= self.end_address()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    pub unit_id: u8,
    #[serde(default)]
    pub blocks: Vec<RegisterBlockConfig>,
}

impl UnitConfig {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            blocks: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: RegisterBlockConfig) -> Self {
        self.blocks.push(block);
        self
    }

    /// True when every address in the range belongs to a configured measurement.
    pub fn covers(&self, block_type: RegisterBlockType, start: u16, count: u16) -> bool {
        (0..count as u32).all(|i| {
            let address = start as u32 + i;
            self.blocks.iter().any(|b| {
                b.block_type == block_type
                    && address >= b.start_address as u32
                    && address < b.end_address()
            })
        })
    }

    /// Reject blocks that run past the address space or overlap another block
    /// of the same type.
    pub fn validate(&self) -> Result<(), ServerError> {
        for (i, block) in self.blocks.iter().enumerate() {
            if block.end_address() > 0x1_0000 {
                return Err(ServerError::Config(format!(
                    "Unit {} {} block at {} runs past the end of the address space",
                    self.unit_id, block.block_type, block.start_address
                )));
            }
            for other in self.blocks.iter().skip(i + 1) {
                if other.block_type == block.block_type
                    && (other.start_address as u32) < block.end_address()
                    && (block.start_address as u32) < other.end_address()
                {
                    return Err(ServerError::Config(format!(
                        "Unit {} {} blocks at {} and {} overlap",
                        self.unit_id, block.block_type, block.start_address, other.start_address
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Locate a measurement by control ID across a configuration tree.
pub fn find_control<'a>(
    units: &'a [UnitConfig],
    control_id: &str,
) -> Option<(&'a UnitConfig, &'a RegisterBlockConfig, u16, &'a MeasurementConfig)> {
    for unit in units {
        for block in &unit.blocks {
            for (address, meas) in block.addressed_measurements() {
                if meas.control_id().as_deref() == Some(control_id) {
                    return Some((unit, block, address as u16, meas));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_size() {
        assert_eq!(MeasurementConfig::new("s", "p", ModbusDataType::Float64).size(), 4);
        assert_eq!(
            MeasurementConfig::new("s", "p", ModbusDataType::StringUtf8)
                .with_word_length(8)
                .size(),
            8
        );
        assert_eq!(MeasurementConfig::default().size(), 1);
    }

    #[test]
    fn test_validity() {
        assert!(MeasurementConfig::new("meter/1", "watts", ModbusDataType::Int16).is_valid());
        assert!(!MeasurementConfig::new(" ", "watts", ModbusDataType::Int16).is_valid());
        assert!(!MeasurementConfig::default().is_valid());
    }

    #[test]
    fn test_transforms() {
        let meas = MeasurementConfig::new("s", "p", ModbusDataType::Int32).with_multiplier(10.0);
        assert_eq!(meas.apply_transforms(&json!(1.26)), json!(13.0));
        assert_eq!(meas.reverse_transforms(&json!(130)), json!(13.0));

        let meas = MeasurementConfig::new("s", "p", ModbusDataType::Float32).with_decimal_scale(2);
        assert_eq!(meas.apply_transforms(&json!(1.005_1)), json!(1.01));
        assert_eq!(meas.apply_transforms(&json!(-2.5)), json!(-2.5));

        let meas = MeasurementConfig::new("s", "p", ModbusDataType::Int16);
        assert_eq!(meas.apply_transforms(&json!(1500)), json!(1500));
        assert_eq!(meas.apply_transforms(&json!(2.5)), json!(3.0));
        assert_eq!(meas.apply_transforms(&json!(-2.5)), json!(-3.0));
        assert_eq!(meas.apply_transforms(&json!("text")), json!("text"));

        let meas = MeasurementConfig::new("s", "p", ModbusDataType::Float32).with_decimal_scale(-1);
        assert_eq!(meas.apply_transforms(&json!(1.23456)), json!(1.23456));
    }

    #[test]
    fn test_block_addresses() {
        let block = RegisterBlockConfig::new(RegisterBlockType::Holding, 1000)
            .with_measurement(MeasurementConfig::new("a", "x", ModbusDataType::Float32))
            .with_measurement(MeasurementConfig::new("a", "y", ModbusDataType::Int16))
            .with_measurement(MeasurementConfig::new("a", "z", ModbusDataType::UInt64));
        let addresses: Vec<u32> = block.addressed_measurements().map(|(a, _)| a).collect();
        assert_eq!(addresses, vec![1000, 1002, 1003]);
        assert_eq!(block.end_address(), 1007);
        assert!(block.covers(RegisterBlockType::Holding, 1002, 5));
        assert!(!block.covers(RegisterBlockType::Holding, 1002, 6));
    }

    #[test]
    fn test_overlapping_blocks_are_invalid() {
        let unit = UnitConfig::new(1)
            .with_block(
                RegisterBlockConfig::new(RegisterBlockType::Holding, 0)
                    .with_measurement(MeasurementConfig::new("a", "x", ModbusDataType::Float32)),
            )
            .with_block(
                RegisterBlockConfig::new(RegisterBlockType::Holding, 1)
                    .with_measurement(MeasurementConfig::new("a", "y", ModbusDataType::Int16)),
            );
        assert!(matches!(unit.validate(), Err(ServerError::Config(_))));

        let unit = UnitConfig::new(1)
            .with_block(
                RegisterBlockConfig::new(RegisterBlockType::Holding, 0)
                    .with_measurement(MeasurementConfig::new("a", "x", ModbusDataType::Float32)),
            )
            .with_block(
                RegisterBlockConfig::new(RegisterBlockType::Input, 0)
                    .with_measurement(MeasurementConfig::new("a", "y", ModbusDataType::Int16)),
            );
        assert!(unit.validate().is_ok());
        assert!(unit.covers(RegisterBlockType::Holding, 0, 2));
        assert!(!unit.covers(RegisterBlockType::Input, 0, 2));
    }

    #[test]
    fn test_find_control() {
        let units = vec![UnitConfig::new(2).with_block(
            RegisterBlockConfig::new(RegisterBlockType::Input, 10)
                .with_measurement(MeasurementConfig::new("m", "a", ModbusDataType::Int32))
                .with_measurement(MeasurementConfig::new("m", "b", ModbusDataType::Int16)),
        )];
        let (unit, _, address, meas) = find_control(&units, "m/b").unwrap();
        assert_eq!(unit.unit_id, 2);
        assert_eq!(address, 12);
        assert_eq!(meas.property_name.as_deref(), Some("b"));
        assert!(find_control(&units, "m/c").is_none());
    }
}
