//! Conversion between measurement values and 16-bit register words.
//!
//! Multi-word values are laid out big-endian with the most significant word
//! first. Byte and string types pack two bytes per word, high byte first, and
//! are zero padded or truncated to the configured word count.

use serde_json::{Number, Value};

use super::types::ModbusDataType;
use crate::utils::error::ServerError;

/// Encode `value` as exactly `size` register words.
///
/// `size` only matters for variable-length types; fixed-width types always
/// produce their natural word count.
pub fn encode_value(data_type: ModbusDataType, value: &Value, size: u16) -> Result<Vec<u16>, ServerError> {
    let words = match data_type {
        ModbusDataType::Boolean => vec![coerce_bit(value) as u16],
        ModbusDataType::Float16 => vec![f32_to_f16_bits(float_value(value)? as f32)],
        ModbusDataType::Float32 => u32_words((float_value(value)? as f32).to_bits()),
        ModbusDataType::Float64 => u64_words(float_value(value)?.to_bits()),
        ModbusDataType::Int16 => vec![integer_value(value)? as i16 as u16],
        ModbusDataType::UInt16 => vec![integer_value(value)? as u16],
        ModbusDataType::Int32 => u32_words(integer_value(value)? as i32 as u32),
        ModbusDataType::UInt32 => u32_words(integer_value(value)? as u32),
        ModbusDataType::Int64 => u64_words(integer_value(value)? as i64 as u64),
        ModbusDataType::UInt64 => u64_words(integer_value(value)? as u64),
        ModbusDataType::Bytes => bytes_to_words(&byte_value(value), size),
        ModbusDataType::StringAscii => {
            let ascii: Vec<u8> = text_value(value)
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect();
            bytes_to_words(&ascii, size)
        }
        ModbusDataType::StringUtf8 => bytes_to_words(text_value(value).as_bytes(), size),
    };
    Ok(words)
}

/// Decode register words previously produced by [`encode_value`].
pub fn decode_value(data_type: ModbusDataType, words: &[u16]) -> Result<Value, ServerError> {
    let needed = data_type.word_length() as usize;
    if words.len() < needed.max(1) {
        return Err(ServerError::InvalidData(format!(
            "{} needs {} registers, got {}",
            data_type,
            needed.max(1),
            words.len()
        )));
    }

    let value = match data_type {
        ModbusDataType::Boolean => Value::Bool(words[0] != 0),
        ModbusDataType::Float16 => float_json(f16_bits_to_f32(words[0]) as f64),
        ModbusDataType::Float32 => float_json(f32::from_bits(words_u32(words)) as f64),
        ModbusDataType::Float64 => float_json(f64::from_bits(words_u64(words))),
        ModbusDataType::Int16 => Value::from(words[0] as i16),
        ModbusDataType::UInt16 => Value::from(words[0]),
        ModbusDataType::Int32 => Value::from(words_u32(words) as i32),
        ModbusDataType::UInt32 => Value::from(words_u32(words)),
        ModbusDataType::Int64 => Value::from(words_u64(words) as i64),
        ModbusDataType::UInt64 => Value::from(words_u64(words)),
        ModbusDataType::Bytes => Value::Array(words_to_bytes(words).into_iter().map(Value::from).collect()),
        ModbusDataType::StringAscii | ModbusDataType::StringUtf8 => {
            let mut bytes = words_to_bytes(words);
            while bytes.last() == Some(&0) {
                bytes.pop();
            }
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
    };
    Ok(value)
}

/// Bit coercion for coil and discrete blocks: booleans as-is, numbers are true
/// when their integer part is non-zero, anything else is parsed as text.
pub fn coerce_bit(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i != 0
            } else if let Some(u) = n.as_u64() {
                u != 0
            } else {
                n.as_f64().map(|f| f.trunc() != 0.0).unwrap_or(false)
            }
        }
        Value::String(s) => parse_boolean(s),
        Value::Null => false,
        other => parse_boolean(&other.to_string()),
    }
}

pub fn parse_boolean(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "true" | "t" | "yes" | "y" | "on" | "1"
    )
}

/// Numeric view of a value as used by the scaling transforms.
pub fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn integer_value(value: &Value) -> Result<i128, ServerError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i as i128)
            } else if let Some(u) = n.as_u64() {
                Ok(u as i128)
            } else {
                Ok(n.as_f64().map(|f| f.trunc() as i128).unwrap_or(0))
            }
        }
        Value::Bool(b) => Ok(*b as i128),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i128>()
                .or_else(|_| s.parse::<f64>().map(|f| f.trunc() as i128))
                .map_err(|_| ServerError::InvalidData(format!("Not an integer value: {}", s)))
        }
        other => Err(ServerError::InvalidData(format!("Not an integer value: {}", other))),
    }
}

fn float_value(value: &Value) -> Result<f64, ServerError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ServerError::InvalidData(format!("Not a numeric value: {}", n))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ServerError::InvalidData(format!("Not a numeric value: {}", s))),
        other => Err(ServerError::InvalidData(format!("Not a numeric value: {}", other))),
    }
}

fn text_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn byte_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_u64())
            .map(|b| b as u8)
            .collect(),
        other => text_value(other).into_bytes(),
    }
}

fn float_json(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn u32_words(v: u32) -> Vec<u16> {
    vec![(v >> 16) as u16, v as u16]
}

fn u64_words(v: u64) -> Vec<u16> {
    vec![(v >> 48) as u16, (v >> 32) as u16, (v >> 16) as u16, v as u16]
}

fn words_u32(words: &[u16]) -> u32 {
    ((words[0] as u32) << 16) | words[1] as u32
}

fn words_u64(words: &[u16]) -> u64 {
    words[..4].iter().fold(0u64, |acc, w| (acc << 16) | *w as u64)
}

pub fn bytes_to_words(bytes: &[u8], size: u16) -> Vec<u16> {
    let mut words: Vec<u16> = bytes
        .chunks(2)
        .map(|pair| {
            let hi = pair[0] as u16;
            let lo = pair.get(1).copied().unwrap_or(0) as u16;
            (hi << 8) | lo
        })
        .collect();
    words.resize(size.max(1) as usize, 0);
    words
}

pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// IEEE 754 binary16 from binary32, rounding to nearest even.
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let x = value.to_bits();
    let sign = ((x >> 16) & 0x8000) as u16;
    let exp = ((x >> 23) & 0xFF) as i32;
    let mant = x & 0x007F_FFFF;

    if exp == 0xFF {
        return sign | 0x7C00 | if mant != 0 { 0x0200 } else { 0 };
    }

    let e = exp - 127 + 15;
    if e >= 0x1F {
        return sign | 0x7C00;
    }
    if e <= 0 {
        if e < -10 {
            return sign;
        }
        let m = mant | 0x0080_0000;
        let shift = (14 - e) as u32;
        let half = 1u32 << (shift - 1);
        let rounded = (m + half - 1 + ((m >> shift) & 1)) >> shift;
        return sign | rounded as u16;
    }

    let half_mant = mant >> 13;
    let round_bits = mant & 0x1FFF;
    let mut h = ((e as u32) << 10) | half_mant;
    if round_bits > 0x1000 || (round_bits == 0x1000 && (half_mant & 1) == 1) {
        // carry may roll into the exponent, which is still correct
        h += 1;
    }
    sign | h as u16
}

pub fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0f32 } else { 1.0f32 };
    let exp = ((bits >> 10) & 0x1F) as i32;
    let mant = (bits & 0x03FF) as f32;
    match exp {
        0 => sign * mant * 2f32.powi(-24),
        0x1F => {
            if mant == 0.0 {
                sign * f32::INFINITY
            } else {
                f32::NAN
            }
        }
        _ => sign * (1.0 + mant / 1024.0) * 2f32.powi(exp - 15),
    }
}
