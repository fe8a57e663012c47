use csv::WriterBuilder;
use std::io::Write;

use super::csv_parser::{CsvColumn, InstanceConfig, CSV_HEADERS};
use super::model::MeasurementConfig;
use crate::utils::error::ServerError;

/// Write instances in unit → block → measurement order.
///
/// Settings without a column are emitted as `#param` rows ahead of their
/// instance. Each block's first row carries its unit ID, register type and
/// start address; following rows rely on the importer advancing the address
/// by each measurement's size.
pub fn write_csv<W: Write>(writer: W, instances: &[InstanceConfig]) -> Result<(), ServerError> {
    let mut csv = WriterBuilder::new().flexible(true).from_writer(writer);
    csv.write_record(CSV_HEADERS)?;

    for instance in instances {
        let config = &instance.config;
        for (key, value) in config.meta_settings() {
            csv.write_record(["#param", key.as_str(), value.as_str()])?;
        }

        let mut first_row = true;
        let mut instance_cells = || -> [String; 4] {
            if std::mem::take(&mut first_row) {
                [
                    instance.key.clone(),
                    config.bind_address.clone(),
                    config.port.to_string(),
                    config.request_throttle_ms.to_string(),
                ]
            } else {
                Default::default()
            }
        };

        let mut wrote_any = false;
        for unit in &config.units {
            for block in &unit.blocks {
                let mut explicit_address = true;
                for (address, meas) in block.addressed_measurements() {
                    if !meas.is_valid() {
                        explicit_address = true;
                        continue;
                    }
                    let mut row: Vec<String> = vec![String::new(); CSV_HEADERS.len()];
                    row[..4].clone_from_slice(&instance_cells());
                    if explicit_address {
                        row[CsvColumn::UnitId.index()] = unit.unit_id.to_string();
                        row[CsvColumn::RegisterType.index()] = block.block_type.to_string();
                        row[CsvColumn::RegisterAddress.index()] = address.to_string();
                        explicit_address = false;
                    }
                    fill_measurement(&mut row, meas);
                    csv.write_record(&row)?;
                    wrote_any = true;
                }
            }
        }

        if !wrote_any {
            let mut row: Vec<String> = vec![String::new(); CSV_HEADERS.len()];
            row[..4].clone_from_slice(&instance_cells());
            csv.write_record(&row)?;
        }
    }

    csv.flush()?;
    Ok(())
}

fn fill_measurement(row: &mut [String], meas: &MeasurementConfig) {
    row[CsvColumn::DataType.index()] = meas.data_type.key().to_string();
    if meas.data_type.is_variable_length() {
        row[CsvColumn::DataLength.index()] = meas.size().to_string();
    }
    row[CsvColumn::SourceId.index()] = meas.source_id.clone().unwrap_or_default();
    row[CsvColumn::Property.index()] = meas.property_name.clone().unwrap_or_default();
    if meas.unit_multiplier != 1.0 {
        row[CsvColumn::Multiplier.index()] = meas.unit_multiplier.to_string();
    }
    if meas.decimal_scale != 0 {
        row[CsvColumn::DecimalScale.index()] = meas.decimal_scale.to_string();
    }
}
