//! Metrics
//!
//! Free functions emit through the `metrics` facade at the point where things
//! happen; `MetricsCollector` keeps process-local counters fed from the event
//! bus so a run summary can be logged without an exporter installed.

use metrics::{counter, gauge, histogram};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crate::{
    core::{ProbeOutcome, ScanEvent},
    error::ScannerError,
};

pub fn record_probe_outcome(outcome: &ProbeOutcome) {
    counter!("probes_total", 1, "status" => outcome.status.as_str());
    histogram!("probe_duration_seconds", outcome.elapsed.as_secs_f64());
}

pub fn record_scan_completed(kind: &'static str, duration: Duration, open_ports: usize) {
    counter!("scans_completed_total", 1, "kind" => kind);
    histogram!("scan_duration_seconds", duration.as_secs_f64(), "kind" => kind);
    gauge!("last_scan_open_ports", open_ports as f64);
}

pub fn record_scan_aborted(kind: &'static str, error: &ScannerError) {
    counter!("scans_aborted_total", 1, "kind" => kind, "code" => error.code());
}

pub fn record_budget_exhausted() {
    counter!("script_budget_exhausted_total", 1);
}

pub fn record_waf_verdict(detected: bool, confidence: f64) {
    counter!("waf_detections_total", 1, "detected" => detected.to_string());
    gauge!("last_waf_confidence", confidence);
}

pub fn record_http_probe(blocked: bool) {
    counter!("waf_probe_requests_total", 1, "blocked" => blocked.to_string());
}

/// Process-local counters fed from scan events
pub struct MetricsCollector {
    start_time: Instant,
    scans_completed: AtomicU64,
    scans_aborted: AtomicU64,
    ports_discovered: AtomicU64,
    scripts_run: AtomicU64,
    script_failures: AtomicU64,
    warnings: AtomicU64,
    total_scan_millis: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            scans_completed: AtomicU64::new(0),
            scans_aborted: AtomicU64::new(0),
            ports_discovered: AtomicU64::new(0),
            scripts_run: AtomicU64::new(0),
            script_failures: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
            total_scan_millis: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, event: &ScanEvent) {
        match event {
            ScanEvent::StateChanged { .. } => {}
            ScanEvent::PortDiscovered { .. } => {
                self.ports_discovered.fetch_add(1, Ordering::Relaxed);
            }
            ScanEvent::ScriptCompleted { outcome, .. } => {
                self.scripts_run.fetch_add(1, Ordering::Relaxed);
                if !outcome.is_success() {
                    self.script_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            ScanEvent::Warning { .. } => {
                self.warnings.fetch_add(1, Ordering::Relaxed);
            }
            ScanEvent::ScanCompleted { duration, .. } => {
                self.scans_completed.fetch_add(1, Ordering::Relaxed);
                self.total_scan_millis
                    .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
            }
            ScanEvent::ScanAborted { .. } => {
                self.scans_aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_scan_stats(&self) -> ScanStats {
        let completed = self.scans_completed.load(Ordering::Relaxed);
        let total_millis = self.total_scan_millis.load(Ordering::Relaxed);
        ScanStats {
            scans_completed: completed,
            scans_aborted: self.scans_aborted.load(Ordering::Relaxed),
            ports_discovered: self.ports_discovered.load(Ordering::Relaxed),
            scripts_run: self.scripts_run.load(Ordering::Relaxed),
            script_failures: self.script_failures.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            average_scan_duration: if completed == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(total_millis / completed)
            },
            uptime: self.start_time.elapsed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub scans_completed: u64,
    pub scans_aborted: u64,
    pub ports_discovered: u64,
    pub scripts_run: u64,
    pub script_failures: u64,
    pub warnings: u64,
    pub average_scan_duration: Duration,
    pub uptime: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_metrics_collection() {
        let collector = MetricsCollector::new();
        let scan_id = Uuid::new_v4();

        collector.observe(&ScanEvent::ScriptCompleted {
            scan_id,
            port: 80,
            outcome: ProbeOutcome::timeout("http-title.nse", Duration::from_secs(5), Duration::from_secs(5)),
        });
        collector.observe(&ScanEvent::ScanCompleted {
            scan_id,
            open_ports: 2,
            duration: Duration::from_secs(4),
        });
        collector.observe(&ScanEvent::ScanCompleted {
            scan_id,
            open_ports: 0,
            duration: Duration::from_secs(2),
        });

        let stats = collector.get_scan_stats();
        assert_eq!(stats.scripts_run, 1);
        assert_eq!(stats.script_failures, 1);
        assert_eq!(stats.scans_completed, 2);
        assert_eq!(stats.average_scan_duration, Duration::from_secs(3));
    }

    #[test]
    fn test_facade_calls_without_recorder() {
        record_budget_exhausted();
        record_waf_verdict(true, 0.7);
        record_http_probe(false);
    }
}
