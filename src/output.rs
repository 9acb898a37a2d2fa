//! Output formatting for query results and CSV export.
//!
//! Supports JSON logging and CSV in the fixed export column order.

use csv::WriterBuilder;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use crate::error::Result;
use crate::normalize::Observation;

/// Export column order, matching the field order of [`Observation`].
pub const EXPORT_COLUMNS: [&str; 6] = ["date", "region", "value", "metric", "source_id", "epiweek"];

/// Logs a value as pretty-printed JSON.
pub fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    info!("{}", rendered);
    Ok(())
}

/// Writes a header row followed by one row per observation.
///
/// The header is written even when `rows` is empty.
pub fn write_csv<W: Write>(writer: W, rows: &[Observation]) -> Result<()> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(writer);

    writer.write_record(EXPORT_COLUMNS)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    Ok(())
}

/// Writes the export to `path`, replacing any existing file.
pub fn write_csv_file(path: &Path, rows: &[Observation]) -> Result<()> {
    debug!(path = %path.display(), rows = rows.len(), "Writing CSV export");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    write_csv(file, rows)
}
