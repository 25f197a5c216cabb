//! In-process counters, timing aggregates and the per-request log record.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::{BindVars, Target};

/// Named monotonically increasing counters.
#[derive(Debug, Default)]
pub struct Counters {
    inner: Mutex<HashMap<String, u64>>,
}

impl Counters {
    pub fn add(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.inner.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.inner.lock().unwrap().clone()
    }
}

/// Aggregate of recorded durations for one operation name.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingAggregate {
    pub count: u64,
    pub total_us: u64,
    pub max_us: u64,
}

/// Named latency aggregates.
#[derive(Debug, Default)]
pub struct Timings {
    inner: Mutex<HashMap<String, TimingAggregate>>,
}

impl Timings {
    /// Record the elapsed time since `start` under `name`.
    pub fn record(&self, name: &str, start: Instant) {
        self.record_duration(name, start.elapsed());
    }

    pub fn record_duration(&self, name: &str, elapsed: Duration) {
        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        let mut inner = self.inner.lock().unwrap();
        let agg = inner.entry(name.to_string()).or_default();
        agg.count += 1;
        agg.total_us += us;
        agg.max_us = agg.max_us.max(us);
    }

    pub fn count(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .get(name)
            .map(|a| a.count)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, TimingAggregate> {
        self.inner.lock().unwrap().clone()
    }
}

/// All stats published by one tablet server.
#[derive(Debug, Default)]
pub struct Stats {
    pub query_timings: Timings,
    pub wait_timings: Timings,
    pub error_counters: Counters,
    pub internal_errors: Counters,
    pub message_counters: Counters,
}

/// Rate limiter for repetitive log lines (pool-full, hot-row key failures).
#[derive(Debug)]
pub struct ThrottledLog {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ThrottledLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// True when enough time has passed since the last permitted line.
    pub fn ready(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Structured record of one request, emitted when the request finishes.
/// Records with an empty method are no-ops (autocommit BEGIN, serializer
/// pre-waits) and are suppressed.
#[derive(Debug, Default)]
pub struct ExecLogRecord {
    pub method: String,
    pub original_sql: String,
    pub bind_vars: BindVars,
    pub target: Option<Target>,
    pub transaction_id: i64,
    pub reserved_id: i64,
    pub error: Option<String>,
}

impl ExecLogRecord {
    pub fn new(method: &str, sql: &str) -> Self {
        Self {
            method: method.to_string(),
            original_sql: sql.to_string(),
            ..Default::default()
        }
    }

    /// Emit the record as one structured event.
    pub fn send(&self, start: Instant) {
        if self.method.is_empty() {
            return;
        }
        let duration_us = start.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        match &self.error {
            Some(error) => tracing::info!(
                target: "shale_tablet::querylog",
                method = %self.method,
                sql = %self.original_sql,
                transaction_id = self.transaction_id,
                reserved_id = self.reserved_id,
                duration_us,
                error = %error,
                "request finished"
            ),
            None => tracing::debug!(
                target: "shale_tablet::querylog",
                method = %self.method,
                sql = %self.original_sql,
                transaction_id = self.transaction_id,
                reserved_id = self.reserved_id,
                duration_us,
                "request finished"
            ),
        }
    }
}
