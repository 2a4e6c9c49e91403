/// Bounded record of command-channel traffic.
///
/// Oldest entries fall off once `capacity` is reached. Readers pull a copy
/// with `tail`; nothing is ever pushed to them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::protocol::to_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Request received from a controller.
    Inbound,
    /// Reply sent back.
    Outbound,
    /// Connection / lifecycle note.
    Event,
}

impl Direction {
    fn marker(self) -> &'static str {
        match self {
            Direction::Inbound => "<<",
            Direction::Outbound => ">>",
            Direction::Event => "--",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub direction: Direction,
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.at.format("%H:%M:%S%.3f"),
            self.direction.marker(),
            self.message
        )
    }
}

#[derive(Debug)]
pub struct CommandLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl CommandLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, direction: Direction, message: impl Into<String>) {
        let entry = LogEntry {
            at: Utc::now(),
            direction,
            message: message.into(),
        };
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn record_bytes(&self, direction: Direction, bytes: &[u8]) {
        self.record(direction, to_hex(bytes));
    }

    /// The newest `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
