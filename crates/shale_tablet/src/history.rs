//! Bounded ring of serving-state transitions for operator display.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// One recorded transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangeRecord {
    /// Unix milliseconds at the time of the transition.
    pub time_ms: u64,
    pub serving_state: String,
    pub tablet_type: String,
}

/// Keeps the most recent `capacity` transitions.
#[derive(Debug)]
pub struct HistoryRing {
    capacity: usize,
    records: Mutex<VecDeque<StateChangeRecord>>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn add(&self, serving_state: &str, tablet_type: &str) {
        let time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut records = self.records.lock().unwrap();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(StateChangeRecord {
            time_ms,
            serving_state: serving_state.to_string(),
            tablet_type: tablet_type.to_string(),
        });
    }

    /// Newest record last.
    pub fn records(&self) -> Vec<StateChangeRecord> {
        self.records.lock().unwrap().iter().cloned().collect()
    }
}
