pub mod encoding;
pub mod frame;
pub mod protocol;
pub mod types;

pub use frame::{crc16_modbus, decode_rtu_frame, read_tcp_frame, write_frame};
pub use protocol::{FrameHeader, MbapHeader, ModbusException, ModbusFrame, ModbusRequest, ModbusResponse};
pub use types::{ExceptionCode, FunctionCode, ModbusDataType, RegisterBlockType};
