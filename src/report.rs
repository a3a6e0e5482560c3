// src/report.rs
//
// Human-readable exports of the Monitor Cache and Tracer Log.
//
// Two layouts: fixed-width text (columns left-justified to the widest cell,
// joined by two spaces) and `;`-delimited records with a header row. The
// layout is picked from the file extension.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::io::format_id;
use crate::monitor::MonitorCache;
use crate::tracer::{TracerEntry, TracerLog};

pub const DELIMITER: char = ';';

pub const MONITOR_HEADERS: [&str; 6] = ["ID", "DLC", "Data", "Period", "Count", "Message Name"];
pub const TRACER_HEADERS: [&str; 5] = ["Time", "ID", "DLC", "Data", "Message Name"];

// ============================================================================
// Layout
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    /// Fixed-width columns separated by two spaces
    Aligned,
    /// `;`-separated fields with a header row
    Delimited,
}

impl ExportFormat {
    /// `.txt` selects aligned text; anything else is delimited.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("txt") => ExportFormat::Aligned,
            _ => ExportFormat::Delimited,
        }
    }
}

/// Render a header and rows in the given layout. Every line ends with `\n`.
pub fn render(format: ExportFormat, headers: &[&str], rows: &[Vec<String>]) -> String {
    match format {
        ExportFormat::Aligned => render_aligned(headers, rows),
        ExportFormat::Delimited => render_delimited(headers, rows),
    }
}

fn render_aligned(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    for cells in std::iter::once(&header_cells).chain(rows) {
        let line: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect();
        out.push_str(&line.join("  "));
        out.push('\n');
    }
    out
}

fn render_delimited(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    for cells in std::iter::once(&header_cells).chain(rows) {
        out.push_str(&delimited_line(cells));
        out.push('\n');
    }
    out
}

/// Join one record. Fields holding the delimiter, a quote or a line break are
/// quoted, with embedded quotes doubled.
pub fn delimited_line(cells: &[String]) -> String {
    cells
        .iter()
        .map(|cell| {
            if cell.contains([DELIMITER, '"', '\n', '\r']) {
                format!("\"{}\"", cell.replace('"', "\"\""))
            } else {
                cell.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(&DELIMITER.to_string())
}

/// Split delimited text into records, each tagged with the line it starts
/// on. A quoted field may span line breaks. Blank lines are skipped.
pub fn delimited_records(text: &str) -> Vec<(usize, Vec<String>)> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    quoted = false;
                }
            }
            '"' if field.is_empty() => quoted = true,
            '\n' => {
                line += 1;
                if quoted {
                    field.push('\n');
                } else {
                    fields.push(std::mem::take(&mut field));
                    push_record(&mut records, record_line, std::mem::take(&mut fields));
                    record_line = line;
                }
            }
            '\r' if !quoted && chars.peek() == Some(&'\n') => {}
            c if c == DELIMITER && !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        push_record(&mut records, record_line, fields);
    }
    records
}

fn push_record(records: &mut Vec<(usize, Vec<String>)>, line: usize, fields: Vec<String>) {
    if fields.len() == 1 && fields[0].trim().is_empty() {
        return;
    }
    records.push((line, fields));
}

// ============================================================================
// Rows
// ============================================================================

/// One row per id, ascending
pub fn monitor_rows(cache: &MonitorCache) -> Vec<Vec<String>> {
    cache
        .entries()
        .map(|(id, entry)| {
            vec![
                format_id(id, entry.extended),
                entry.dlc.to_string(),
                entry.payload_hex.clone(),
                format!("{:.2}", entry.period_ms),
                entry.count.to_string(),
                entry.comment.clone(),
            ]
        })
        .collect()
}

pub fn tracer_row(log: &TracerLog, entry: &TracerEntry) -> Vec<String> {
    vec![
        format!("{:.3}", log.relative_time(entry)),
        format_id(entry.frame.id(), entry.frame.is_extended()),
        entry.frame.dlc().to_string(),
        entry.frame.payload_hex(),
        entry.name.clone(),
    ]
}

pub fn tracer_rows(log: &TracerLog) -> Vec<Vec<String>> {
    log.entries().iter().map(|e| tracer_row(log, e)).collect()
}

// ============================================================================
// Files
// ============================================================================

/// Write the monitor snapshot to `path`. Returns the number of rows.
pub fn export_monitor(cache: &MonitorCache, path: &Path) -> io::Result<usize> {
    let rows = monitor_rows(cache);
    write_file(path, &MONITOR_HEADERS, &rows)?;
    tlog!("[report] Monitor: {} row(s) written to {}", rows.len(), path.display());
    Ok(rows.len())
}

/// Write the whole tracer log to `path`. Returns the number of rows.
pub fn export_tracer(log: &TracerLog, path: &Path) -> io::Result<usize> {
    let rows = tracer_rows(log);
    write_file(path, &TRACER_HEADERS, &rows)?;
    tlog!("[report] Tracer: {} row(s) written to {}", rows.len(), path.display());
    Ok(rows.len())
}

pub(crate) fn write_file(path: &Path, headers: &[&str], rows: &[Vec<String>]) -> io::Result<()> {
    let text = render(ExportFormat::from_path(path), headers, rows);
    let mut file = File::create(path)?;
    file.write_all(text.as_bytes())?;
    file.flush()
}

/// Live recording of the tracer into a file.
///
/// `start` writes the log so far as a full export; frames seen afterwards are
/// buffered with `record` and appended by `flush`. Appended aligned-text rows
/// are joined by two spaces without padding, since later widths are unknown.
pub struct TraceRecorder {
    path: PathBuf,
    format: ExportFormat,
    buffer: Vec<Vec<String>>,
}

impl TraceRecorder {
    pub fn start(path: &Path, log: &TracerLog) -> io::Result<Self> {
        export_tracer(log, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            format: ExportFormat::from_path(path),
            buffer: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, log: &TracerLog, entry: &TracerEntry) {
        self.buffer.push(tracer_row(log, entry));
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append buffered rows. The buffer is kept if the write fails.
    pub fn flush(&mut self) -> io::Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let mut text = String::new();
        for row in &self.buffer {
            match self.format {
                ExportFormat::Aligned => text.push_str(&row.join("  ")),
                ExportFormat::Delimited => text.push_str(&delimited_line(row)),
            }
            text.push('\n');
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(text.as_bytes())?;
        let count = self.buffer.len();
        self.buffer.clear();
        Ok(count)
    }
}
