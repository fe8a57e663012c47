//! Bulk server configuration import from CSV.
//!
//! Each row maps one measurement. The instance ID column selects (or starts)
//! a server instance; an empty ID continues the current one and `-` allocates
//! the next sequential number. Unit ID, register type and register address
//! carry over from the previous row of the same instance, and the address
//! advances by each measurement's size. `#param key value` rows collect
//! settings for the next instance started; other `#` rows are comments.

use csv::{ReaderBuilder, StringRecord, Trim};
use log::{info, warn};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use super::model::{MeasurementConfig, RegisterBlockConfig, UnitConfig};
use super::settings::ServerConfig;
use crate::modbus::types::{ModbusDataType, RegisterBlockType};
use crate::utils::error::ServerError;

pub const CSV_HEADERS: [&str; 13] = [
    "Instance ID",
    "Bind Address",
    "Port",
    "Throttle",
    "Unit ID",
    "Register Type",
    "Register Address",
    "Data Type",
    "Data Length",
    "Source ID",
    "Property",
    "Multiplier",
    "Decimal Scale",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvColumn {
    InstanceId = 0,
    BindAddress,
    Port,
    Throttle,
    UnitId,
    RegisterType,
    RegisterAddress,
    DataType,
    DataLength,
    SourceId,
    Property,
    Multiplier,
    DecimalScale,
}

impl CsvColumn {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn header(self) -> &'static str {
        CSV_HEADERS[self.index()]
    }
}

/// A server configuration together with the instance ID it was keyed by.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub key: String,
    pub config: ServerConfig,
}

/// Result of an import: parsed instances plus operator facing diagnostics.
#[derive(Debug, Default)]
pub struct CsvImport {
    pub instances: Vec<InstanceConfig>,
    pub messages: Vec<String>,
}

impl CsvImport {
    pub fn instance(&self, key: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|i| i.key == key)
    }
}

type AddressMap = BTreeMap<u16, MeasurementConfig>;

#[derive(Default)]
struct InstanceLayout {
    units: Vec<(u8, Vec<(RegisterBlockType, AddressMap)>)>,
}

impl InstanceLayout {
    fn addresses(&mut self, unit_id: u8, block_type: RegisterBlockType) -> &mut AddressMap {
        let unit_idx = match self.units.iter().position(|(id, _)| *id == unit_id) {
            Some(i) => i,
            None => {
                self.units.push((unit_id, Vec::new()));
                self.units.len() - 1
            }
        };
        let blocks = &mut self.units[unit_idx].1;
        let block_idx = match blocks.iter().position(|(t, _)| *t == block_type) {
            Some(i) => i,
            None => {
                blocks.push((block_type, BTreeMap::new()));
                blocks.len() - 1
            }
        };
        &mut blocks[block_idx].1
    }

    /// Contiguous measurements form one block; a gap starts a new one.
    fn into_units(self) -> Vec<UnitConfig> {
        self.units
            .into_iter()
            .map(|(unit_id, blocks)| {
                let mut unit = UnitConfig::new(unit_id);
                for (block_type, addresses) in blocks {
                    let mut current: Option<RegisterBlockConfig> = None;
                    for (address, meas) in addresses {
                        let contiguous = current
                            .as_ref()
                            .map(|b| b.end_address() == address as u32)
                            .unwrap_or(false);
                        if !contiguous {
                            if let Some(done) = current.take() {
                                unit.blocks.push(done);
                            }
                            current = Some(RegisterBlockConfig::new(block_type, address));
                        }
                        if let Some(block) = current.as_mut() {
                            block.measurements.push(meas);
                        }
                    }
                    if let Some(done) = current {
                        unit.blocks.push(done);
                    }
                }
                unit
            })
            .filter(|u| !u.blocks.is_empty())
            .collect()
    }
}

struct RowReader<'a> {
    record: &'a StringRecord,
    row: u64,
    messages: &'a mut Vec<String>,
}

impl<'a> RowReader<'a> {
    fn string(&self, column: CsvColumn) -> Option<String> {
        self.record
            .get(column.index())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn parse<T: FromStr>(&mut self, column: CsvColumn, kind: &str) -> Option<T> {
        let s = self.string(column)?;
        match s.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.messages.push(format!(
                    "Row {}: malformed {} value [{}] in column {}",
                    self.row,
                    kind,
                    s,
                    column.header()
                ));
                None
            }
        }
    }

    fn data_type(&mut self) -> Option<ModbusDataType> {
        let s = self.string(CsvColumn::DataType)?;
        let parsed = ModbusDataType::parse_lenient(&s);
        if parsed.is_none() {
            self.messages.push(format!(
                "Row {}: malformed data type value [{}] in column {}",
                self.row,
                s,
                CsvColumn::DataType.header()
            ));
        }
        parsed
    }
}

#[derive(Default)]
pub struct ServerConfigCsvParser {
    instances: Vec<InstanceConfig>,
    layouts: Vec<InstanceLayout>,
    messages: Vec<String>,
}

impl ServerConfigCsvParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one CSV stream. Row level problems are reported as messages; only
    /// unreadable input fails the whole stream.
    pub fn parse<R: Read>(mut self, reader: R) -> Result<CsvImport, ServerError> {
        let mut csv = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let mut pending_meta: BTreeMap<String, String> = BTreeMap::new();
        let mut current: Option<usize> = None;
        let mut unit_id: u8 = 0;
        let mut block_type: Option<RegisterBlockType> = None;
        let mut address: u32 = 0;

        for result in csv.records() {
            let record = result?;
            let row_num = record.position().map(|p| p.line()).unwrap_or(0);
            if record.iter().all(|f| f.trim().is_empty()) {
                continue;
            }

            let Some(key) = self.row_key(&record, current) else {
                continue;
            };

            if key.starts_with('#') {
                if key.eq_ignore_ascii_case("#param") {
                    let meta_key = record.get(1).map(str::trim).unwrap_or_default();
                    let meta_val = record.get(2).map(str::trim).unwrap_or_default();
                    if !meta_key.is_empty() && !meta_val.is_empty() {
                        pending_meta.insert(meta_key.to_string(), meta_val.to_string());
                    }
                }
                continue;
            }

            let mut row = RowReader {
                record: &record,
                row: row_num,
                messages: &mut self.messages,
            };

            let is_current = current.map(|i| self.instances[i].key == key).unwrap_or(false);
            if !is_current {
                match self.instances.iter().position(|i| i.key == key) {
                    Some(existing) => current = Some(existing),
                    None => {
                        let mut config = ServerConfig::default();
                        if let Some(bind) = row.string(CsvColumn::BindAddress) {
                            config.bind_address = bind;
                        }
                        if let Some(port) = row.parse::<u16>(CsvColumn::Port, "integer") {
                            config.port = port;
                        }
                        if let Some(throttle) = row.parse::<u64>(CsvColumn::Throttle, "integer") {
                            config.request_throttle_ms = throttle;
                        }
                        config.meta = std::mem::take(&mut pending_meta);
                        for message in config.apply_meta() {
                            row.messages.push(format!("Row {}: {}", row_num, message));
                        }
                        self.instances.push(InstanceConfig { key: key.clone(), config });
                        self.layouts.push(InstanceLayout::default());
                        current = Some(self.instances.len() - 1);
                    }
                }
                unit_id = 0;
                block_type = None;
                address = 0;
            }
            let Some(idx) = current else {
                continue;
            };

            if let Some(id) = row.parse::<u8>(CsvColumn::UnitId, "integer") {
                unit_id = id;
            }

            match row.string(CsvColumn::RegisterType) {
                Some(value) if block_type.map(|t| !t.name().eq_ignore_ascii_case(&value)).unwrap_or(true) => {
                    match value.parse::<RegisterBlockType>() {
                        Ok(t) => block_type = Some(t),
                        Err(_) => {
                            row.messages.push(format!(
                                "Row {}: invalid register type [{}]",
                                row_num, value
                            ));
                            continue;
                        }
                    }
                }
                _ => {}
            }
            let Some(current_block_type) = block_type else {
                // nothing to map without a register type
                continue;
            };

            if let Some(a) = row.parse::<u16>(CsvColumn::RegisterAddress, "integer") {
                address = a as u32;
            }

            let mut meas = MeasurementConfig::default();
            if let Some(t) = row.data_type() {
                meas.data_type = t;
            }
            if let Some(len) = row.parse::<u16>(CsvColumn::DataLength, "integer") {
                if len >= 1 {
                    meas.word_length = len;
                }
            }
            meas.source_id = row.string(CsvColumn::SourceId);
            meas.property_name = row.string(CsvColumn::Property);
            if let Some(m) = row.parse::<f64>(CsvColumn::Multiplier, "decimal") {
                meas.unit_multiplier = m;
            }
            if let Some(s) = row.parse::<i32>(CsvColumn::DecimalScale, "integer") {
                meas.decimal_scale = s;
            }

            if !meas.is_valid() {
                row.messages.push(format!(
                    "Row {}: measurement needs a source ID and property; row skipped",
                    row_num
                ));
                continue;
            }

            let size = meas.size() as u32;
            if address + size > 0x1_0000 {
                row.messages.push(format!(
                    "Row {}: address {} with size {} exceeds the register address space",
                    row_num, address, size
                ));
                continue;
            }

            let addresses = self.layouts[idx].addresses(unit_id, current_block_type);
            let overlap = addresses
                .range(..=(address + size - 1) as u16)
                .any(|(a, m)| address < *a as u32 + m.size() as u32);
            if overlap {
                row.messages.push(format!(
                    "Row {}: unit {} {} address {} overlaps an earlier measurement; row skipped",
                    row_num, unit_id, current_block_type, address
                ));
                continue;
            }

            addresses.insert(address as u16, meas);
            address += size;
        }

        let ServerConfigCsvParser {
            mut instances,
            layouts,
            messages,
        } = self;
        for (instance, layout) in instances.iter_mut().zip(layouts) {
            instance.config.units = layout.into_units();
        }

        info!("Parsed {} Modbus server configuration(s) from CSV", instances.len());
        Ok(CsvImport { instances, messages })
    }

    fn row_key(&self, record: &StringRecord, current: Option<usize>) -> Option<String> {
        let key = record.get(0).map(str::trim).unwrap_or_default();
        if key == "-" {
            return Some((self.instances.len() + 1).to_string());
        }
        if !key.is_empty() {
            return Some(key.to_string());
        }
        current.map(|i| self.instances[i].key.clone())
    }
}

pub fn parse_csv<R: Read>(reader: R) -> Result<CsvImport, ServerError> {
    ServerConfigCsvParser::new().parse(reader)
}

/// Parse several files into one import. A file that cannot be read is
/// reported and skipped without affecting instances parsed from the others.
pub fn parse_csv_files<P: AsRef<Path>>(paths: &[P]) -> CsvImport {
    let mut combined = CsvImport::default();
    for path in paths {
        let path = path.as_ref();
        let result = std::fs::File::open(path)
            .map_err(ServerError::from)
            .and_then(parse_csv);
        match result {
            Ok(import) => {
                combined.instances.extend(import.instances);
                combined
                    .messages
                    .extend(import.messages.into_iter().map(|m| format!("{}: {}", path.display(), m)));
            }
            Err(e) => {
                warn!("Failed to parse CSV file {}: {}", path.display(), e);
                combined.messages.push(format!("{}: {}", path.display(), e));
            }
        }
    }
    combined
}
