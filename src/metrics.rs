//! Process-local consumer metrics.
//!
//! Counters reset only on restart. Processing time keeps a rolling window of
//! the last [`PROCESSING_WINDOW`] samples.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

pub const PROCESSING_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    failed: u64,
    validated: u64,
    validation_failures: u64,
    dlq: u64,
    tenant_skipped: u64,
    duplicates_skipped: u64,
    breaker_rejections: u64,
    left_pending: u64,
    by_type: BTreeMap<String, u64>,
    samples: VecDeque<Duration>,
    last_processed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_validated: u64,
    pub validation_failures: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub average_processing_time_ms: f64,
    pub processing_samples: usize,
    pub dlq_count: u64,
    pub tenant_skipped: u64,
    pub duplicates_skipped: u64,
    pub breaker_rejections: u64,
    pub left_pending: u64,
    pub last_processed_at: Option<String>,
    pub uptime_seconds: u64,
}

#[derive(Debug)]
pub struct MetricsRecorder {
    counters: Mutex<Counters>,
    started: Instant,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    /// An acknowledged message went through a handler.
    ///
    /// `success` is false for handler-reported benign failures.
    pub fn record_handled(&self, event_type: &str, elapsed: Duration, success: bool) {
        let mut c = self.counters.lock();
        if success {
            c.processed += 1;
        } else {
            c.failed += 1;
        }
        *c.by_type.entry(event_type.to_string()).or_default() += 1;
        if c.samples.len() == PROCESSING_WINDOW {
            c.samples.pop_front();
        }
        c.samples.push_back(elapsed);
        c.last_processed = Some(Utc::now());
    }

    /// A message failed without reaching a handler (parse error, DLQ write).
    pub fn record_failed(&self) {
        self.counters.lock().failed += 1;
    }

    pub fn record_validated(&self) {
        self.counters.lock().validated += 1;
    }

    pub fn record_validation_failure(&self) {
        let mut c = self.counters.lock();
        c.validation_failures += 1;
        c.failed += 1;
    }

    pub fn record_dlq(&self) {
        self.counters.lock().dlq += 1;
    }

    pub fn record_tenant_skipped(&self) {
        self.counters.lock().tenant_skipped += 1;
    }

    pub fn record_duplicate(&self) {
        self.counters.lock().duplicates_skipped += 1;
    }

    pub fn record_breaker_rejection(&self) {
        self.counters.lock().breaker_rejections += 1;
    }

    pub fn record_left_pending(&self) {
        self.counters.lock().left_pending += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.lock();
        let average = if c.samples.is_empty() {
            0.0
        } else {
            let total: Duration = c.samples.iter().sum();
            total.as_secs_f64() * 1000.0 / c.samples.len() as f64
        };

        MetricsSnapshot {
            events_processed: c.processed,
            events_failed: c.failed,
            events_validated: c.validated,
            validation_failures: c.validation_failures,
            events_by_type: c.by_type.clone(),
            average_processing_time_ms: average,
            processing_samples: c.samples.len(),
            dlq_count: c.dlq,
            tenant_skipped: c.tenant_skipped,
            duplicates_skipped: c.duplicates_skipped,
            breaker_rejections: c.breaker_rejections,
            left_pending: c.left_pending,
            last_processed_at: c
                .last_processed
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handled_counts() {
        let metrics = MetricsRecorder::new();
        metrics.record_handled("role.permissions_changed", Duration::from_millis(10), true);
        metrics.record_handled("role.permissions_changed", Duration::from_millis(30), false);
        metrics.record_validation_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.events_processed, 1);
        assert_eq!(snap.events_failed, 2);
        assert_eq!(snap.validation_failures, 1);
        assert_eq!(snap.events_by_type["role.permissions_changed"], 2);
        assert!((snap.average_processing_time_ms - 20.0).abs() < 1e-9);
        assert!(snap.last_processed_at.is_some());
    }

    #[test]
    fn test_window_is_capped() {
        let metrics = MetricsRecorder::new();
        for i in 0..(PROCESSING_WINDOW + 50) {
            let ms = if i < 50 { 1000 } else { 2 };
            metrics.record_handled("user.created", Duration::from_millis(ms), true);
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.processing_samples, PROCESSING_WINDOW);
        assert!((snap.average_processing_time_ms - 2.0).abs() < 1e-9);
        assert_eq!(snap.events_processed, (PROCESSING_WINDOW + 50) as u64);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(MetricsRecorder::new().snapshot()).unwrap();
        assert!(json.get("eventsProcessed").is_some());
        assert!(json.get("eventsByType").is_some());
        assert!(json.get("dlqCount").is_some());
    }
}
