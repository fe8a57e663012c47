//! CSV backup and restore of persisted register values.
//!
//! Columns: `ServerId, UnitId, BlockType, Address, Created, Modified, Value`.
//! Dates are RFC 3339 in UTC with milliseconds; values are four hex digits.

use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;

use super::dao::RegisterDao;
use super::models::RegisterRecord;
use crate::modbus::types::RegisterBlockType;
use crate::utils::error::ServerError;

#[derive(Debug, Serialize, Deserialize)]
struct BackupRow {
    #[serde(rename = "ServerId")]
    server_id: String,
    #[serde(rename = "UnitId")]
    unit_id: u8,
    #[serde(rename = "BlockType")]
    block_type: String,
    #[serde(rename = "Address")]
    address: u16,
    #[serde(rename = "Created")]
    created: String,
    #[serde(rename = "Modified")]
    modified: String,
    #[serde(rename = "Value")]
    value: String,
}

impl From<&RegisterRecord> for BackupRow {
    fn from(record: &RegisterRecord) -> Self {
        Self {
            server_id: record.server_id.clone(),
            unit_id: record.unit_id,
            block_type: record.block_type.name().to_string(),
            address: record.address,
            created: record.created.to_rfc3339_opts(SecondsFormat::Millis, true),
            modified: record.modified.to_rfc3339_opts(SecondsFormat::Millis, true),
            value: hex::encode(record.value.to_be_bytes()),
        }
    }
}

impl BackupRow {
    fn into_record(self) -> Result<RegisterRecord, ServerError> {
        Ok(RegisterRecord {
            block_type: self.block_type.parse::<RegisterBlockType>()?,
            created: parse_date(&self.created)?,
            modified: parse_date(&self.modified)?,
            value: parse_hex_word(&self.value)?,
            server_id: self.server_id,
            unit_id: self.unit_id,
            address: self.address,
        })
    }
}

fn parse_date(s: &str) -> Result<DateTime<Utc>, ServerError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ServerError::InvalidData(format!("Invalid date '{}': {}", s, e)))
}

fn parse_hex_word(s: &str) -> Result<u16, ServerError> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    let padded = format!("{:0>4}", digits);
    let bytes = hex::decode(&padded).map_err(|e| ServerError::InvalidData(format!("Invalid value '{}': {}", s, e)))?;
    match bytes.as_slice() {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(ServerError::InvalidData(format!("Value '{}' is not a 16-bit word", s))),
    }
}

/// Outcome of a backup import: stored records plus per-row diagnostics.
#[derive(Debug, Default)]
pub struct BackupImport {
    pub imported: usize,
    pub messages: Vec<String>,
}

#[derive(Clone)]
pub struct RegisterBackupService {
    dao: Arc<dyn RegisterDao>,
}

impl RegisterBackupService {
    pub fn new(dao: Arc<dyn RegisterDao>) -> Self {
        Self { dao }
    }

    /// Write every record of `server_id`; returns the row count.
    pub async fn export_csv<W: Write>(&self, server_id: &str, writer: W) -> Result<usize, ServerError> {
        let records = self.dao.find_all(server_id).await?;
        let mut csv = csv::Writer::from_writer(writer);
        for record in &records {
            csv.serialize(BackupRow::from(record))?;
        }
        if records.is_empty() {
            csv.write_record(["ServerId", "UnitId", "BlockType", "Address", "Created", "Modified", "Value"])?;
        }
        csv.flush()?;
        info!("📤 Exported {} register(s) for server {}", records.len(), server_id);
        Ok(records.len())
    }

    /// Restore rows belonging to `server_id`. Rows for other servers and
    /// malformed rows are reported and skipped.
    pub async fn import_csv<R: Read>(&self, server_id: &str, reader: R, replace: bool) -> Result<BackupImport, ServerError> {
        let mut result = BackupImport::default();
        let mut records = Vec::new();

        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        for (i, row) in csv.deserialize::<BackupRow>().enumerate() {
            let line = i + 2;
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    result.messages.push(format!("Row {}: {}", line, e));
                    continue;
                }
            };
            if row.server_id != server_id {
                result.messages.push(format!(
                    "Row {}: skipping register for server '{}' (expected '{}')",
                    line, row.server_id, server_id
                ));
                continue;
            }
            match row.into_record() {
                Ok(record) => records.push(record),
                Err(e) => result.messages.push(format!("Row {}: {}", line, e)),
            }
        }

        for message in &result.messages {
            warn!("{}", message);
        }

        result.imported = self.dao.import(server_id, &records, replace).await?;
        info!("📥 Imported {} register(s) for server {}", result.imported, server_id);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRegisterDao;
    use crate::storage::models::record_timestamp;

    #[test]
    fn test_parse_hex_word() {
        assert_eq!(parse_hex_word("00ff").unwrap(), 0x00FF);
        assert_eq!(parse_hex_word("FFFF").unwrap(), 0xFFFF);
        assert_eq!(parse_hex_word("0x1").unwrap(), 1);
        assert!(parse_hex_word("12345").is_err());
        assert!(parse_hex_word("zz").is_err());
    }

    #[tokio::test]
    async fn test_export_format() {
        let dao = Arc::new(MemoryRegisterDao::new());
        let created = parse_date("2024-03-01T10:00:00.000Z").unwrap();
        let modified = parse_date("2024-03-01T10:05:30.250Z").unwrap();
        let mut record = RegisterRecord::new("srv", 3, RegisterBlockType::Holding, 12, 0x00FF, created);
        record.modified = modified;
        dao.save(&record).await.unwrap();

        let service = RegisterBackupService::new(dao);
        let mut buf = Vec::new();
        assert_eq!(service.export_csv("srv", &mut buf).await.unwrap(), 1);

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ServerId,UnitId,BlockType,Address,Created,Modified,Value");
        assert_eq!(
            lines[1],
            "srv,3,Holding,12,2024-03-01T10:00:00.000Z,2024-03-01T10:05:30.250Z,00ff"
        );
    }

    #[tokio::test]
    async fn test_backup_then_restore() {
        let source = Arc::new(MemoryRegisterDao::new());
        let now = record_timestamp();
        for (address, value) in [(0u16, 1u16), (1, 0), (5, 1)] {
            source
                .save(&RegisterRecord::new("srv", 1, RegisterBlockType::Coil, address, value, now))
                .await
                .unwrap();
        }
        source
            .save(&RegisterRecord::new("srv", 2, RegisterBlockType::Input, 40, 0xBEEF, now))
            .await
            .unwrap();

        let mut buf = Vec::new();
        RegisterBackupService::new(source.clone())
            .export_csv("srv", &mut buf)
            .await
            .unwrap();

        let target = Arc::new(MemoryRegisterDao::new());
        let result = RegisterBackupService::new(target.clone())
            .import_csv("srv", &buf[..], true)
            .await
            .unwrap();
        assert_eq!(result.imported, 4);
        assert!(result.messages.is_empty());
        assert_eq!(target.find_all("srv").await.unwrap(), source.find_all("srv").await.unwrap());
    }

    #[tokio::test]
    async fn test_import_skips_foreign_and_bad_rows() {
        let csv = "ServerId,UnitId,BlockType,Address,Created,Modified,Value\n\
                   srv,1,Holding,0,2024-01-01T00:00:00.000Z,2024-01-01T00:00:00.000Z,0010\n\
                   other,1,Holding,1,2024-01-01T00:00:00.000Z,2024-01-01T00:00:00.000Z,0011\n\
                   srv,1,Bogus,2,2024-01-01T00:00:00.000Z,2024-01-01T00:00:00.000Z,0012\n\
                   srv,1,Holding,3,yesterday,2024-01-01T00:00:00.000Z,0013\n";
        let dao = Arc::new(MemoryRegisterDao::new());
        let result = RegisterBackupService::new(dao.clone())
            .import_csv("srv", csv.as_bytes(), false)
            .await
            .unwrap();

        assert_eq!(result.imported, 1);
        assert_eq!(result.messages.len(), 3);
        assert!(result.messages[0].contains("other"));
        let stored = dao.find_all("srv").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, 0x10);
    }
}
