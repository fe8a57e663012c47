pub mod backup;
pub mod dao;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod migrations;
pub mod models;
#[cfg(feature = "sqlite")]
pub mod sqlite_manager;

pub use backup::{BackupImport, RegisterBackupService};
pub use dao::{RegisterDao, RegisterPersister};
pub use memory::MemoryRegisterDao;
pub use models::RegisterRecord;
#[cfg(feature = "sqlite")]
pub use sqlite_manager::SqliteManager;
