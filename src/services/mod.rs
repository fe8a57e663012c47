pub mod connection;
pub mod datum_bridge;
pub mod scheduler;
pub mod server;

pub use connection::{ConnectionHandler, RegisterWriteListener};
pub use datum_bridge::{DatumBridge, MeasurementListener, MeasurementUpdate, OperationalModes};
pub use scheduler::{ScheduledFuture, ScheduledTask, TaskScheduler, TokioScheduler};
pub use server::{ModbusServer, ServerStatus};
