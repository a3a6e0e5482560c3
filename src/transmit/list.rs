// src/transmit/list.rs
//
// Transmit list files: the whole table as delimited records
// `ID;DLC;Data;Period;Count;Comment;Trigger ID`.
//
// The Period column carries the mode: a positive period, `0`/`off`, `RTR` or
// `Trigger` (tokens are case-insensitive on import). Remote slots write `R`
// in the Data column. Counts are exported for reference and reset on import.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{parse_id, TransmitSlot, TransmitTable, TxMode, ValidationError};
use crate::io::{format_id, format_payload};
use crate::report::{self, delimited_records};

pub const LIST_HEADERS: [&str; 7] = ["ID", "DLC", "Data", "Period", "Count", "Comment", "Trigger ID"];

const REMOTE_MARKER: &str = "R";

#[derive(Debug, Error)]
pub enum ListError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: {source}")]
    Row {
        line: usize,
        #[source]
        source: ValidationError,
    },
    #[error("{0} contains no transmit rows")]
    Empty(PathBuf),
}

// ============================================================================
// Export
// ============================================================================

/// One record per slot in table order, scratch slot included.
pub fn list_rows(table: &TransmitTable) -> Vec<Vec<String>> {
    table.iter().map(|(_, slot)| slot_row(slot)).collect()
}

fn slot_row(slot: &TransmitSlot) -> Vec<String> {
    let data = if slot.is_remote() {
        REMOTE_MARKER.to_string()
    } else {
        format_payload(slot.payload())
    };
    let trigger = match slot.mode() {
        TxMode::Trigger { trigger_id } => format!("{:X}", trigger_id),
        _ => String::new(),
    };
    vec![
        format_id(slot.id(), slot.is_extended()),
        slot.dlc().to_string(),
        data,
        slot.mode().label(),
        slot.sent_count().to_string(),
        slot.comment().to_string(),
        trigger,
    ]
}

/// Write the table to `path`; `.txt` gives aligned text, anything else the
/// delimited form that `import` reads back.
pub fn export(table: &TransmitTable, path: &Path) -> Result<usize, ListError> {
    let rows = list_rows(table);
    report::write_file(path, &LIST_HEADERS, &rows).map_err(|source| ListError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tlog!("[transmit] Saved {} slot(s) to {}", rows.len(), path.display());
    Ok(rows.len())
}

// ============================================================================
// Import
// ============================================================================

/// Parse delimited list text into slots, in file order.
///
/// The header, blank lines and records with fewer than seven fields are
/// skipped. Any field that fails validation rejects the whole list.
pub fn parse(text: &str) -> Result<Vec<TransmitSlot>, ListError> {
    let mut slots = Vec::new();
    for (line_no, fields) in delimited_records(text) {
        if fields.len() < LIST_HEADERS.len() {
            tlog!("[transmit] Skipping line {}: {} field(s)", line_no, fields.len());
            continue;
        }
        if fields[0].trim().eq_ignore_ascii_case(LIST_HEADERS[0]) {
            continue;
        }
        let slot = parse_row(&fields).map_err(|source| ListError::Row {
            line: line_no,
            source,
        })?;
        slots.push(slot);
    }
    Ok(slots)
}

fn parse_row(fields: &[String]) -> Result<TransmitSlot, ValidationError> {
    let mode = parse_mode(&fields[3], &fields[6])?;
    let data = fields[2].trim();
    let remote = data.eq_ignore_ascii_case(REMOTE_MARKER);
    TransmitSlot::parse(&fields[0], &fields[1], data, remote, mode, &fields[5])
}

/// Decode the Period column, with the Trigger ID column for trigger slots.
pub fn parse_mode(period: &str, trigger_id: &str) -> Result<TxMode, ValidationError> {
    let token = period.trim();
    if token.eq_ignore_ascii_case("off") || token.is_empty() {
        return Ok(TxMode::Off);
    }
    if token.eq_ignore_ascii_case("rtr") {
        return Ok(TxMode::Rtr);
    }
    if token.eq_ignore_ascii_case("trigger") {
        let (trigger_id, _) = parse_id(trigger_id)
            .map_err(|_| ValidationError::InvalidTriggerId(trigger_id.to_string()))?;
        return Ok(TxMode::Trigger { trigger_id });
    }
    match token.parse::<u32>() {
        Ok(0) => Ok(TxMode::Off),
        Ok(period_ms) => Ok(TxMode::Periodic { period_ms }),
        Err(_) => Err(ValidationError::InvalidPeriod(period.to_string())),
    }
}

/// Read a list file. The caller replaces the table with the result, the
/// first slot landing in the scratch slot.
pub fn import(path: &Path) -> Result<Vec<TransmitSlot>, ListError> {
    let text = std::fs::read_to_string(path).map_err(|source| ListError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let slots = parse(&text)?;
    if slots.is_empty() {
        return Err(ListError::Empty(path.to_path_buf()));
    }
    tlog!("[transmit] Loaded {} slot(s) from {}", slots.len(), path.display());
    Ok(slots)
}
