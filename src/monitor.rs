// src/monitor.rs
//
// Monitor cache: latest state per CAN id, with inter-arrival period and
// change detection.

use std::collections::BTreeMap;

use crate::dbc::NameResolver;
use crate::io::Frame;

#[derive(Clone, Debug, PartialEq)]
pub struct MonitorEntry {
    pub extended: bool,
    pub dlc: u8,
    pub payload_hex: String,
    /// Frames seen for this id since the last reset
    pub count: u64,
    pub last_timestamp: f64,
    /// Milliseconds since the previous frame with this id; 0.0 on first arrival
    pub period_ms: f64,
    pub comment: String,
    /// Payload differs from the previous arrival, or this is the first one
    pub changed: bool,
}

#[derive(Debug, Default)]
pub struct MonitorCache {
    entries: BTreeMap<u32, MonitorEntry>,
}

impl MonitorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one received frame into the cache.
    ///
    /// `name` replaces the stored comment only when non-empty, so a comment
    /// typed by the user survives while no database is loaded.
    pub fn update(&mut self, frame: &Frame, name: &str) {
        let payload_hex = frame.payload_hex();
        match self.entries.get_mut(&frame.id()) {
            None => {
                self.entries.insert(
                    frame.id(),
                    MonitorEntry {
                        extended: frame.is_extended(),
                        dlc: frame.dlc(),
                        payload_hex,
                        count: 1,
                        last_timestamp: frame.timestamp(),
                        period_ms: 0.0,
                        comment: name.to_string(),
                        changed: true,
                    },
                );
            }
            Some(entry) => {
                entry.period_ms = (frame.timestamp() - entry.last_timestamp) * 1000.0;
                entry.changed = payload_hex != entry.payload_hex;
                entry.count += 1;
                entry.extended = frame.is_extended();
                entry.dlc = frame.dlc();
                entry.payload_hex = payload_hex;
                entry.last_timestamp = frame.timestamp();
                if !name.is_empty() {
                    entry.comment = name.to_string();
                }
            }
        }
    }

    /// User edit of an id's comment. Returns false if the id was never seen.
    pub fn set_comment(&mut self, id: u32, comment: &str) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.comment = comment.to_string();
                true
            }
            None => false,
        }
    }

    /// Re-apply names after the database changed. Counts, periods and
    /// timestamps are left alone.
    pub fn rebuild_comments(&mut self, resolver: &dyn NameResolver) {
        for (id, entry) in self.entries.iter_mut() {
            entry.comment = resolver.resolve(*id);
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, id: u32) -> Option<&MonitorEntry> {
        self.entries.get(&id)
    }

    /// Entries in ascending id order
    pub fn entries(&self) -> impl Iterator<Item = (u32, &MonitorEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, payload: &[u8], ts: f64) -> Frame {
        Frame::data(id, false, payload, ts).unwrap()
    }

    #[test]
    fn test_first_arrival() {
        let mut cache = MonitorCache::new();
        cache.update(&frame(0x123, &[1, 2], 10.0), "EngineData");
        let entry = cache.get(0x123).unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.period_ms, 0.0);
        assert!(entry.changed);
        assert_eq!(entry.payload_hex, "01 02");
        assert_eq!(entry.comment, "EngineData");
    }

    #[test]
    fn test_same_payload_is_unchanged() {
        let mut cache = MonitorCache::new();
        cache.update(&frame(0x123, &[1, 2], 10.0), "");
        cache.update(&frame(0x123, &[1, 2], 10.1), "");
        let entry = cache.get(0x123).unwrap();
        assert!(!entry.changed);
        assert_eq!(entry.count, 2);
        assert!((entry.period_ms - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_different_payload_is_changed() {
        let mut cache = MonitorCache::new();
        cache.update(&frame(0x123, &[1, 2], 1.0), "");
        cache.update(&frame(0x123, &[1, 3], 1.25), "");
        let entry = cache.get(0x123).unwrap();
        assert!(entry.changed);
        assert_eq!(entry.count, 2);
        assert!((entry.period_ms - 250.0).abs() < 1e-6);
        assert_eq!(entry.last_timestamp, 1.25);
    }

    #[test]
    fn test_dlc_change_counts_as_change() {
        let mut cache = MonitorCache::new();
        cache.update(&frame(0x10, &[1], 0.0), "");
        cache.update(&frame(0x10, &[1, 0], 0.1), "");
        let entry = cache.get(0x10).unwrap();
        assert!(entry.changed);
        assert_eq!(entry.dlc, 2);
    }

    #[test]
    fn test_empty_name_keeps_user_comment() {
        let mut cache = MonitorCache::new();
        cache.update(&frame(0x50, &[0], 0.0), "");
        assert!(cache.set_comment(0x50, "door lock"));
        cache.update(&frame(0x50, &[0], 0.1), "");
        assert_eq!(cache.get(0x50).unwrap().comment, "door lock");
        cache.update(&frame(0x50, &[0], 0.2), "BodyStatus");
        assert_eq!(cache.get(0x50).unwrap().comment, "BodyStatus");
        assert!(!cache.set_comment(0x51, "x"));
    }

    #[test]
    fn test_rebuild_comments_keeps_counters() {
        let mut cache = MonitorCache::new();
        cache.update(&frame(0x1, &[0], 0.0), "");
        cache.update(&frame(0x1, &[0], 0.5), "");
        cache.update(&frame(0x2, &[0], 0.7), "");

        let resolver = |id: u32| if id == 0x1 { "One".to_string() } else { String::new() };
        cache.rebuild_comments(&resolver);

        let one = cache.get(0x1).unwrap();
        assert_eq!(one.comment, "One");
        assert_eq!(one.count, 2);
        assert!((one.period_ms - 500.0).abs() < 1e-6);
        assert_eq!(cache.get(0x2).unwrap().comment, "");
    }

    #[test]
    fn test_entries_sorted_and_reset() {
        let mut cache = MonitorCache::new();
        for id in [0x300, 0x100, 0x200] {
            cache.update(&frame(id, &[], 0.0), "");
        }
        let ids: Vec<u32> = cache.entries().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0x100, 0x200, 0x300]);
        cache.reset();
        assert!(cache.is_empty());
        cache.update(&frame(0x100, &[], 5.0), "");
        assert_eq!(cache.get(0x100).unwrap().period_ms, 0.0);
    }
}
