use bytes::{BufMut, BytesMut};

use super::frame::crc16_modbus;
use super::types::{ExceptionCode, FunctionCode, RegisterBlockType};
use crate::utils::error::ServerError;

pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

pub const MBAP_HEADER_LEN: usize = 7;
/// Largest PDU allowed by the Modbus application protocol.
pub const MAX_PDU_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, quantity: u16 },
    WriteMultipleRegisters { address: u16, quantity: u16 },
    Exception(ModbusException),
}

/// Exception reply for a request function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusException {
    pub function: u8,
    pub code: ExceptionCode,
}

impl ModbusException {
    pub fn new(function: u8, code: ExceptionCode) -> Self {
        Self { function, code }
    }

    pub fn to_pdu(&self) -> Vec<u8> {
        vec![self.function | 0x80, self.code.code()]
    }
}

impl ModbusRequest {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            ModbusRequest::ReadCoils { .. } => FunctionCode::ReadCoils,
            ModbusRequest::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            ModbusRequest::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            ModbusRequest::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            ModbusRequest::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            ModbusRequest::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            ModbusRequest::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            ModbusRequest::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn block_type(&self) -> RegisterBlockType {
        self.function_code().block_type()
    }

    pub fn is_write(&self) -> bool {
        self.function_code().is_write()
    }

    /// Start address and number of addresses touched by the request.
    pub fn address_range(&self) -> (u16, u16) {
        match self {
            ModbusRequest::ReadCoils { address, quantity }
            | ModbusRequest::ReadDiscreteInputs { address, quantity }
            | ModbusRequest::ReadHoldingRegisters { address, quantity }
            | ModbusRequest::ReadInputRegisters { address, quantity } => (*address, *quantity),
            ModbusRequest::WriteSingleCoil { address, .. }
            | ModbusRequest::WriteSingleRegister { address, .. } => (*address, 1),
            ModbusRequest::WriteMultipleCoils { address, values } => (*address, values.len() as u16),
            ModbusRequest::WriteMultipleRegisters { address, values } => (*address, values.len() as u16),
        }
    }

    pub fn from_pdu(pdu: &[u8]) -> Result<Self, ModbusException> {
        let fc_byte = match pdu.first() {
            Some(b) => *b,
            None => return Err(ModbusException::new(0, ExceptionCode::IllegalFunction)),
        };
        let fc = FunctionCode::from_byte(fc_byte)
            .ok_or_else(|| ModbusException::new(fc_byte, ExceptionCode::IllegalFunction))?;
        let body = &pdu[1..];
        let fail = |code| ModbusException::new(fc_byte, code);

        if body.len() < 4 {
            return Err(fail(ExceptionCode::IllegalDataValue));
        }
        let address = u16::from_be_bytes([body[0], body[1]]);
        let word = u16::from_be_bytes([body[2], body[3]]);

        let check_range = |quantity: u16, max: u16| -> Result<(), ModbusException> {
            if quantity == 0 || quantity > max {
                return Err(fail(ExceptionCode::IllegalDataValue));
            }
            if address as u32 + quantity as u32 > 0x1_0000 {
                return Err(fail(ExceptionCode::IllegalDataAddress));
            }
            Ok(())
        };

        match fc {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => {
                if body.len() != 4 {
                    return Err(fail(ExceptionCode::IllegalDataValue));
                }
                let max = if fc.block_type().is_bit_type() { MAX_READ_BITS } else { MAX_READ_REGISTERS };
                check_range(word, max)?;
                let quantity = word;
                Ok(match fc {
                    FunctionCode::ReadCoils => ModbusRequest::ReadCoils { address, quantity },
                    FunctionCode::ReadDiscreteInputs => ModbusRequest::ReadDiscreteInputs { address, quantity },
                    FunctionCode::ReadHoldingRegisters => ModbusRequest::ReadHoldingRegisters { address, quantity },
                    _ => ModbusRequest::ReadInputRegisters { address, quantity },
                })
            }
            FunctionCode::WriteSingleCoil => {
                if body.len() != 4 {
                    return Err(fail(ExceptionCode::IllegalDataValue));
                }
                let value = match word {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return Err(fail(ExceptionCode::IllegalDataValue)),
                };
                Ok(ModbusRequest::WriteSingleCoil { address, value })
            }
            FunctionCode::WriteSingleRegister => {
                if body.len() != 4 {
                    return Err(fail(ExceptionCode::IllegalDataValue));
                }
                Ok(ModbusRequest::WriteSingleRegister { address, value: word })
            }
            FunctionCode::WriteMultipleCoils => {
                let quantity = word;
                check_range(quantity, MAX_WRITE_BITS)?;
                let byte_count = *body.get(4).ok_or_else(|| fail(ExceptionCode::IllegalDataValue))? as usize;
                if byte_count != (quantity as usize + 7) / 8 || body.len() != 5 + byte_count {
                    return Err(fail(ExceptionCode::IllegalDataValue));
                }
                let values = unpack_bits(&body[5..], quantity as usize);
                Ok(ModbusRequest::WriteMultipleCoils { address, values })
            }
            FunctionCode::WriteMultipleRegisters => {
                let quantity = word;
                check_range(quantity, MAX_WRITE_REGISTERS)?;
                let byte_count = *body.get(4).ok_or_else(|| fail(ExceptionCode::IllegalDataValue))? as usize;
                if byte_count != quantity as usize * 2 || body.len() != 5 + byte_count {
                    return Err(fail(ExceptionCode::IllegalDataValue));
                }
                let values = body[5..]
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Ok(ModbusRequest::WriteMultipleRegisters { address, values })
            }
        }
    }

    pub fn to_pdu(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.function_code().code());
        match self {
            ModbusRequest::ReadCoils { address, quantity }
            | ModbusRequest::ReadDiscreteInputs { address, quantity }
            | ModbusRequest::ReadHoldingRegisters { address, quantity }
            | ModbusRequest::ReadInputRegisters { address, quantity } => {
                buf.put_u16(*address);
                buf.put_u16(*quantity);
            }
            ModbusRequest::WriteSingleCoil { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(if *value { 0xFF00 } else { 0x0000 });
            }
            ModbusRequest::WriteSingleRegister { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            ModbusRequest::WriteMultipleCoils { address, values } => {
                let packed = pack_bits(values);
                buf.put_u16(*address);
                buf.put_u16(values.len() as u16);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            }
            ModbusRequest::WriteMultipleRegisters { address, values } => {
                buf.put_u16(*address);
                buf.put_u16(values.len() as u16);
                buf.put_u8((values.len() * 2) as u8);
                for v in values {
                    buf.put_u16(*v);
                }
            }
        }
        buf.to_vec()
    }
}

impl ModbusResponse {
    pub fn to_pdu(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            ModbusResponse::ReadCoils(bits) | ModbusResponse::ReadDiscreteInputs(bits) => {
                let code = if matches!(self, ModbusResponse::ReadCoils(_)) {
                    FunctionCode::ReadCoils
                } else {
                    FunctionCode::ReadDiscreteInputs
                };
                let packed = pack_bits(bits);
                buf.put_u8(code.code());
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            }
            ModbusResponse::ReadHoldingRegisters(words) | ModbusResponse::ReadInputRegisters(words) => {
                let code = if matches!(self, ModbusResponse::ReadHoldingRegisters(_)) {
                    FunctionCode::ReadHoldingRegisters
                } else {
                    FunctionCode::ReadInputRegisters
                };
                buf.put_u8(code.code());
                buf.put_u8((words.len() * 2) as u8);
                for w in words {
                    buf.put_u16(*w);
                }
            }
            ModbusResponse::WriteSingleCoil { address, value } => {
                buf.put_u8(FunctionCode::WriteSingleCoil.code());
                buf.put_u16(*address);
                buf.put_u16(if *value { 0xFF00 } else { 0x0000 });
            }
            ModbusResponse::WriteSingleRegister { address, value } => {
                buf.put_u8(FunctionCode::WriteSingleRegister.code());
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            ModbusResponse::WriteMultipleCoils { address, quantity } => {
                buf.put_u8(FunctionCode::WriteMultipleCoils.code());
                buf.put_u16(*address);
                buf.put_u16(*quantity);
            }
            ModbusResponse::WriteMultipleRegisters { address, quantity } => {
                buf.put_u8(FunctionCode::WriteMultipleRegisters.code());
                buf.put_u16(*address);
                buf.put_u16(*quantity);
            }
            ModbusResponse::Exception(e) => return e.to_pdu(),
        }
        buf.to_vec()
    }

    /// Parse a response PDU. Bit reads decode every bit of the returned bytes,
    /// so callers truncate to the quantity they asked for.
    pub fn from_pdu(pdu: &[u8]) -> Result<Self, ServerError> {
        let fc_byte = *pdu
            .first()
            .ok_or_else(|| ServerError::Protocol("Empty response PDU".to_string()))?;

        if fc_byte & 0x80 != 0 {
            let code = pdu
                .get(1)
                .and_then(|c| ExceptionCode::from_byte(*c))
                .ok_or_else(|| ServerError::Protocol("Invalid exception response".to_string()))?;
            return Ok(ModbusResponse::Exception(ModbusException::new(fc_byte & 0x7F, code)));
        }

        let fc = FunctionCode::from_byte(fc_byte)
            .ok_or_else(|| ServerError::Protocol(format!("Unsupported function code 0x{:02X}", fc_byte)))?;
        let truncated = || ServerError::Protocol(format!("Truncated response for function 0x{:02X}", fc_byte));

        match fc {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => {
                let byte_count = *pdu.get(1).ok_or_else(truncated)? as usize;
                let data = pdu.get(2..2 + byte_count).ok_or_else(truncated)?;
                Ok(match fc {
                    FunctionCode::ReadCoils => ModbusResponse::ReadCoils(unpack_bits(data, byte_count * 8)),
                    FunctionCode::ReadDiscreteInputs => {
                        ModbusResponse::ReadDiscreteInputs(unpack_bits(data, byte_count * 8))
                    }
                    FunctionCode::ReadHoldingRegisters => ModbusResponse::ReadHoldingRegisters(be_words(data)),
                    _ => ModbusResponse::ReadInputRegisters(be_words(data)),
                })
            }
            _ => {
                if pdu.len() != 5 {
                    return Err(truncated());
                }
                let address = u16::from_be_bytes([pdu[1], pdu[2]]);
                let word = u16::from_be_bytes([pdu[3], pdu[4]]);
                Ok(match fc {
                    FunctionCode::WriteSingleCoil => ModbusResponse::WriteSingleCoil { address, value: word == 0xFF00 },
                    FunctionCode::WriteSingleRegister => ModbusResponse::WriteSingleRegister { address, value: word },
                    FunctionCode::WriteMultipleCoils => ModbusResponse::WriteMultipleCoils { address, quantity: word },
                    _ => ModbusResponse::WriteMultipleRegisters { address, quantity: word },
                })
            }
        }
    }
}

/// Pack bits least-significant-bit first, zero padded to a byte boundary.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).map(|b| b & (1 << (i % 8)) != 0).unwrap_or(false))
        .collect()
}

fn be_words(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
}

/// Modbus TCP application header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of the unit ID plus PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn from_bytes(bytes: &[u8; MBAP_HEADER_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        }
    }

    pub fn to_bytes(&self) -> [u8; MBAP_HEADER_LEN] {
        let t = self.transaction_id.to_be_bytes();
        let p = self.protocol_id.to_be_bytes();
        let l = self.length.to_be_bytes();
        [t[0], t[1], p[0], p[1], l[0], l[1], self.unit_id]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    Tcp(MbapHeader),
    /// RTU style framing: no transaction header, only the unit address.
    Headless { unit_id: u8 },
}

impl FrameHeader {
    pub fn unit_id(&self) -> u8 {
        match self {
            FrameHeader::Tcp(h) => h.unit_id,
            FrameHeader::Headless { unit_id } => *unit_id,
        }
    }

    pub fn is_headless(&self) -> bool {
        matches!(self, FrameHeader::Headless { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusFrame {
    pub header: FrameHeader,
    pub pdu: Vec<u8>,
}

impl ModbusFrame {
    pub fn tcp(transaction_id: u16, unit_id: u8, pdu: Vec<u8>) -> Self {
        Self {
            header: FrameHeader::Tcp(MbapHeader {
                transaction_id,
                protocol_id: 0,
                length: pdu.len() as u16 + 1,
                unit_id,
            }),
            pdu,
        }
    }

    pub fn headless(unit_id: u8, pdu: Vec<u8>) -> Self {
        Self {
            header: FrameHeader::Headless { unit_id },
            pdu,
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.header.unit_id()
    }

    /// Response frame mirroring this request's transaction ID, protocol ID and
    /// unit ID, or headless when the request was.
    pub fn reply(&self, pdu: Vec<u8>) -> ModbusFrame {
        let header = match self.header {
            FrameHeader::Tcp(h) => FrameHeader::Tcp(MbapHeader {
                length: pdu.len() as u16 + 1,
                ..h
            }),
            headless => headless,
        };
        ModbusFrame { header, pdu }
    }

    /// Wire bytes: MBAP + PDU for TCP, `unit | PDU | CRC16-LE` for RTU.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + self.pdu.len() + 2);
        match self.header {
            FrameHeader::Tcp(h) => {
                buf.put_slice(&h.to_bytes());
                buf.put_slice(&self.pdu);
            }
            FrameHeader::Headless { unit_id } => {
                buf.put_u8(unit_id);
                buf.put_slice(&self.pdu);
                let crc = crc16_modbus(&buf);
                buf.put_u16_le(crc);
            }
        }
        buf.to_vec()
    }
}
