use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::error::ServerError;

/// One of the four independent Modbus address namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegisterBlockType {
    Coil,
    Discrete,
    Holding,
    Input,
}

impl RegisterBlockType {
    pub const ALL: [RegisterBlockType; 4] = [
        RegisterBlockType::Coil,
        RegisterBlockType::Discrete,
        RegisterBlockType::Holding,
        RegisterBlockType::Input,
    ];

    pub fn is_bit_type(&self) -> bool {
        matches!(self, RegisterBlockType::Coil | RegisterBlockType::Discrete)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RegisterBlockType::Coil => "Coil",
            RegisterBlockType::Discrete => "Discrete",
            RegisterBlockType::Holding => "Holding",
            RegisterBlockType::Input => "Input",
        }
    }
}

impl fmt::Display for RegisterBlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RegisterBlockType {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RegisterBlockType::ALL
            .iter()
            .find(|t| t.name().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| ServerError::InvalidData(format!("Unknown register block type: {}", s)))
    }
}

/// Register encodings a measurement can be mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModbusDataType {
    #[serde(rename = "bit")]
    Boolean,
    #[serde(rename = "f16")]
    Float16,
    #[serde(rename = "f32")]
    Float32,
    #[serde(rename = "f64")]
    Float64,
    #[serde(rename = "s16")]
    Int16,
    #[serde(rename = "u16")]
    UInt16,
    #[serde(rename = "s32")]
    Int32,
    #[serde(rename = "u32")]
    UInt32,
    #[serde(rename = "s64")]
    Int64,
    #[serde(rename = "u64")]
    UInt64,
    #[serde(rename = "bytes")]
    Bytes,
    #[serde(rename = "string-ascii")]
    StringAscii,
    #[serde(rename = "string")]
    StringUtf8,
}

impl ModbusDataType {
    pub const ALL: [ModbusDataType; 13] = [
        ModbusDataType::Boolean,
        ModbusDataType::Float16,
        ModbusDataType::Float32,
        ModbusDataType::Float64,
        ModbusDataType::Int16,
        ModbusDataType::UInt16,
        ModbusDataType::Int32,
        ModbusDataType::UInt32,
        ModbusDataType::Int64,
        ModbusDataType::UInt64,
        ModbusDataType::Bytes,
        ModbusDataType::StringAscii,
        ModbusDataType::StringUtf8,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ModbusDataType::Boolean => "bit",
            ModbusDataType::Float16 => "f16",
            ModbusDataType::Float32 => "f32",
            ModbusDataType::Float64 => "f64",
            ModbusDataType::Int16 => "s16",
            ModbusDataType::UInt16 => "u16",
            ModbusDataType::Int32 => "s32",
            ModbusDataType::UInt32 => "u32",
            ModbusDataType::Int64 => "s64",
            ModbusDataType::UInt64 => "u64",
            ModbusDataType::Bytes => "bytes",
            ModbusDataType::StringAscii => "string-ascii",
            ModbusDataType::StringUtf8 => "string",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModbusDataType::Boolean => "Boolean",
            ModbusDataType::Float16 => "Float16",
            ModbusDataType::Float32 => "Float32",
            ModbusDataType::Float64 => "Float64",
            ModbusDataType::Int16 => "Int16",
            ModbusDataType::UInt16 => "UInt16",
            ModbusDataType::Int32 => "Int32",
            ModbusDataType::UInt32 => "UInt32",
            ModbusDataType::Int64 => "Int64",
            ModbusDataType::UInt64 => "UInt64",
            ModbusDataType::Bytes => "Bytes",
            ModbusDataType::StringAscii => "StringAscii",
            ModbusDataType::StringUtf8 => "StringUtf8",
        }
    }

    /// Fixed register count, or 0 for variable-length types sized by the measurement.
    pub fn word_length(&self) -> u16 {
        match self {
            ModbusDataType::Boolean
            | ModbusDataType::Float16
            | ModbusDataType::Int16
            | ModbusDataType::UInt16 => 1,
            ModbusDataType::Float32 | ModbusDataType::Int32 | ModbusDataType::UInt32 => 2,
            ModbusDataType::Float64 | ModbusDataType::Int64 | ModbusDataType::UInt64 => 4,
            ModbusDataType::Bytes | ModbusDataType::StringAscii | ModbusDataType::StringUtf8 => 0,
        }
    }

    pub fn is_variable_length(&self) -> bool {
        self.word_length() == 0
    }

    pub fn for_key(key: &str) -> Option<ModbusDataType> {
        ModbusDataType::ALL.iter().find(|t| t.key() == key).copied()
    }

    /// Resolve a free-form data type as found in CSV files: a key, an enum name,
    /// or a descriptive phrase such as `32-bit float` or `unsigned int 64`.
    pub fn parse_lenient(value: &str) -> Option<ModbusDataType> {
        let s = value.trim();
        if let Some(t) = ModbusDataType::for_key(s) {
            return Some(t);
        }
        if let Some(t) = ModbusDataType::ALL.iter().find(|t| t.name() == s) {
            return Some(*t);
        }

        let lc = s.to_lowercase();
        if lc == "bool" {
            Some(ModbusDataType::Boolean)
        } else if lc.contains("float") {
            if lc.contains("16") {
                Some(ModbusDataType::Float16)
            } else if lc.contains("64") {
                Some(ModbusDataType::Float64)
            } else {
                Some(ModbusDataType::Float32)
            }
        } else if lc.contains("int") {
            let unsigned = lc.contains("unsigned");
            if lc.contains("32") {
                Some(if unsigned { ModbusDataType::UInt32 } else { ModbusDataType::Int32 })
            } else if lc.contains("64") {
                Some(if unsigned { ModbusDataType::UInt64 } else { ModbusDataType::Int64 })
            } else {
                Some(if unsigned { ModbusDataType::UInt16 } else { ModbusDataType::Int16 })
            }
        } else if lc.contains("utf") {
            Some(ModbusDataType::StringUtf8)
        } else if lc.contains("ascii") {
            Some(ModbusDataType::StringAscii)
        } else if lc.contains("byte") {
            Some(ModbusDataType::Bytes)
        } else {
            None
        }
    }
}

impl Default for ModbusDataType {
    fn default() -> Self {
        ModbusDataType::UInt16
    }
}

impl fmt::Display for ModbusDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModbusDataType {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModbusDataType::parse_lenient(s)
            .ok_or_else(|| ServerError::InvalidData(format!("Unknown data type: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub fn from_byte(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(FunctionCode::ReadCoils),
            0x02 => Some(FunctionCode::ReadDiscreteInputs),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x0F => Some(FunctionCode::WriteMultipleCoils),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::ReadDiscreteInputs => 0x02,
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleCoil => 0x05,
            FunctionCode::WriteSingleRegister => 0x06,
            FunctionCode::WriteMultipleCoils => 0x0F,
            FunctionCode::WriteMultipleRegisters => 0x10,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil
                | FunctionCode::WriteSingleRegister
                | FunctionCode::WriteMultipleCoils
                | FunctionCode::WriteMultipleRegisters
        )
    }

    pub fn block_type(&self) -> RegisterBlockType {
        match self {
            FunctionCode::ReadCoils
            | FunctionCode::WriteSingleCoil
            | FunctionCode::WriteMultipleCoils => RegisterBlockType::Coil,
            FunctionCode::ReadDiscreteInputs => RegisterBlockType::Discrete,
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters => RegisterBlockType::Holding,
            FunctionCode::ReadInputRegisters => RegisterBlockType::Input,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    GatewayTargetDeviceFailedToRespond,
}

impl ExceptionCode {
    pub fn code(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::GatewayTargetDeviceFailedToRespond => 0x0B,
        }
    }

    pub fn from_byte(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::ServerDeviceFailure),
            0x0B => Some(ExceptionCode::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_keys_and_names() {
        assert_eq!(ModbusDataType::for_key("f32"), Some(ModbusDataType::Float32));
        assert_eq!(ModbusDataType::parse_lenient("Int64"), Some(ModbusDataType::Int64));
        assert_eq!(ModbusDataType::parse_lenient("string-ascii"), Some(ModbusDataType::StringAscii));
        assert_eq!(ModbusDataType::for_key("nope"), None);
    }

    #[test]
    fn test_data_type_keywords() {
        assert_eq!(ModbusDataType::parse_lenient("bool"), Some(ModbusDataType::Boolean));
        assert_eq!(ModbusDataType::parse_lenient("32-bit float"), Some(ModbusDataType::Float32));
        assert_eq!(ModbusDataType::parse_lenient("Float 16"), Some(ModbusDataType::Float16));
        assert_eq!(ModbusDataType::parse_lenient("unsigned int 64"), Some(ModbusDataType::UInt64));
        assert_eq!(ModbusDataType::parse_lenient("int32"), Some(ModbusDataType::Int32));
        assert_eq!(ModbusDataType::parse_lenient("integer"), Some(ModbusDataType::Int16));
        assert_eq!(ModbusDataType::parse_lenient("UTF-8 text"), Some(ModbusDataType::StringUtf8));
        assert_eq!(ModbusDataType::parse_lenient("byte array"), Some(ModbusDataType::Bytes));
        assert!("whatever".parse::<ModbusDataType>().is_err());
    }

    #[test]
    fn test_block_type_parse_ignores_case() {
        assert_eq!("holding".parse::<RegisterBlockType>().unwrap(), RegisterBlockType::Holding);
        assert_eq!(" Coil ".parse::<RegisterBlockType>().unwrap(), RegisterBlockType::Coil);
        assert!("Register".parse::<RegisterBlockType>().is_err());
    }

    #[test]
    fn test_function_codes() {
        for code in [1u8, 2, 3, 4, 5, 6, 15, 16] {
            let fc = FunctionCode::from_byte(code).unwrap();
            assert_eq!(fc.code(), code);
        }
        assert_eq!(FunctionCode::from_byte(0x2B), None);
        assert!(FunctionCode::WriteMultipleCoils.is_write());
        assert_eq!(FunctionCode::ReadInputRegisters.block_type(), RegisterBlockType::Input);
    }
}
