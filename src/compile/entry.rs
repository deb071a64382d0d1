//! Timeline entries.

use crate::tdf::{EventClass, Timestamp};

/// One raw event kept on its entry. The reverse pass needs these to find
/// future occurrences of an event class.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub class: EventClass,
    pub value: Option<String>,
    pub detail: Option<String>,
    pub ts: Timestamp,
}

/// One timestep of the compiled timeline, identified by (day, sub-day
/// interval, sequence id). Same-instant elements merge into one entry
/// during the forward pass and are never split afterward. Variable
/// state lives in the timeline's value store, keyed by sequence id.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    /// Age-in-days from the deidentified epoch.
    pub day: i64,
    /// Minute of day of the first element merged into this entry.
    pub interval: u16,
    /// Monotonically increasing position in the compiled sequence.
    pub seq: u32,
    /// Raw events that occurred at this instant.
    pub events: Vec<EventRecord>,
}

impl TimelineEntry {
    pub fn new(day: i64, interval: u16, seq: u32) -> Self {
        Self {
            day,
            interval,
            seq,
            events: Vec::new(),
        }
    }

    pub fn has_event(&self, class: EventClass) -> bool {
        self.events.iter().any(|e| e.class == class)
    }
}
