//! Modbus TCP server library
//!
//! Serves coils, discrete inputs, holding and input registers per unit ID from
//! an in-memory register store. Captured measurements are mapped onto register
//! ranges through a unit → block → measurement configuration tree, client
//! writes can be persisted per server, and both configuration and persisted
//! registers can be moved in bulk as CSV.

pub mod cli;
pub mod config;
pub mod modbus;
pub mod registers;
pub mod services;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::{MeasurementConfig, RegisterBlockConfig, ServerConfig, UnitConfig};
pub use modbus::{ModbusDataType, RegisterBlockType};
pub use registers::RegisterStore;
pub use services::{MeasurementListener, ModbusServer, ServerStatus};
pub use storage::{RegisterDao, RegisterRecord};
pub use utils::error::ServerError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
