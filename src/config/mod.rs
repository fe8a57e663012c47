pub mod csv_parser;
pub mod csv_writer;
pub mod model;
pub mod settings;

pub use csv_parser::{parse_csv, parse_csv_files, CsvImport, InstanceConfig, ServerConfigCsvParser};
pub use csv_writer::write_csv;
pub use model::{MeasurementConfig, RegisterBlockConfig, UnitConfig};
pub use settings::{ServerConfig, SqliteConfig};
