// src/tracer.rs
//
// Tracer log: every accepted frame in arrival order.

use crate::dbc::NameResolver;
use crate::io::Frame;

#[derive(Clone, Debug, PartialEq)]
pub struct TracerEntry {
    pub frame: Frame,
    pub name: String,
}

/// Append-only frame log. Entries are never modified after insertion except
/// by an explicit name rebuild.
#[derive(Debug, Default)]
pub struct TracerLog {
    entries: Vec<TracerEntry>,
    start_time: Option<f64>,
}

impl TracerLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, frame: Frame, name: &str) {
        if self.start_time.is_none() {
            self.start_time = Some(frame.timestamp());
        }
        self.entries.push(TracerEntry {
            frame,
            name: name.to_string(),
        });
    }

    /// Seconds since the first frame logged after the last reset
    pub fn relative_time(&self, entry: &TracerEntry) -> f64 {
        entry.frame.timestamp() - self.start_time.unwrap_or(entry.frame.timestamp())
    }

    pub fn rebuild_comments(&mut self, resolver: &dyn NameResolver) {
        for entry in &mut self.entries {
            entry.name = resolver.resolve(entry.frame.id());
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.start_time = None;
    }

    pub fn entries(&self) -> &[TracerEntry] {
        &self.entries
    }

    /// Entries appended at or after `index`, for incremental display
    pub fn since(&self, index: usize) -> &[TracerEntry] {
        self.entries.get(index..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
