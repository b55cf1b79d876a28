//! # IO Module - Run History Export
//!
//! Flattens the per-tick history into `time, <component>.<key>` rows and
//! writes it as CSV (tabular analysis), JSON (human inspection) or bincode
//! (compact archival). Column order is deterministic: the union of all
//! observed `component.key` pairs, sorted.


use std::fs;
use std::path::Path;

use crate::errors::ExportError;
use crate::harness::Snapshot;

/// The sorted union of `component.key` column names over the whole run.
pub fn history_columns(history: &[Snapshot]) -> Vec<String> {
    let mut columns: Vec<String> = history
        .iter()
        .flat_map(|snapshot| {
            snapshot.states.iter().flat_map(|(id, state)| {
                state.keys().map(move |key| format!("{id}.{key}"))
            })
        })
        .collect();
    columns.sort();
    columns.dedup();
    columns
}

/// Writes the history as a flat CSV table with a `time` column followed by
/// one column per component state variable.
pub fn write_history_csv(history: &[Snapshot], path: &Path) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let columns = history_columns(history);
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec!["time".to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for snapshot in history {
        let mut row = vec![format!("{}", snapshot.time)];
        for column in &columns {
            // State keys carry no dots, so the last dot separates the
            // component id from the key even for dotted ids.
            let (id, key) = column.rsplit_once('.').unwrap_or((column.as_str(), ""));
            let value = snapshot
                .states
                .get(id)
                .and_then(|state| state.get(key))
                .copied();
            row.push(value.map_or(String::new(), |v| format!("{v}")));
        }
        writer.write_record(&row)?;
    }
    writer.flush().map_err(ExportError::Io)?;
    Ok(())
}

/// Writes the history as pretty-printed JSON.
pub fn write_history_json(history: &[Snapshot], path: &Path) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(history)?;
    fs::write(path, json)?;
    Ok(())
}

/// Writes the history as bincode.
pub fn write_history_bin(history: &[Snapshot], path: &Path) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoded = bincode::serialize(history)?;
    fs::write(path, encoded)?;
    Ok(())
}

/// Reads a bincode history back, the inverse of [`write_history_bin`].
pub fn read_history_bin(path: &Path) -> Result<Vec<Snapshot>, ExportError> {
    let bytes = fs::read(path)?;
    Ok(bincode::deserialize(&bytes)?)
}
