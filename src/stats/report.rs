//! Stable reporting schema emitted for external writers and dashboards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{StatsEntry, StatsSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestReport {
    pub name: String,
    pub num_requests: u64,
    pub num_failures: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub stddev_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p90_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub avg_content_length: f64,
    pub current_rps: f64,
    pub current_fail_per_sec: f64,
    pub fail_ratio: f64,
}

impl RequestReport {
    pub fn from_entry(entry: &StatsEntry) -> Self {
        let ms = |d: std::time::Duration| d.as_secs_f64() * 1000.0;
        Self {
            name: entry.name.clone(),
            num_requests: entry.num_requests,
            num_failures: entry.num_failures,
            avg_latency_ms: entry.avg_response_millis(),
            min_latency_ms: entry.min_response_micros.unwrap_or(0) as f64 / 1000.0,
            max_latency_ms: entry.max_response_micros as f64 / 1000.0,
            stddev_latency_ms: entry.stddev_response_millis(),
            p50_latency_ms: ms(entry.percentile(0.5)),
            p90_latency_ms: ms(entry.percentile(0.9)),
            p95_latency_ms: ms(entry.percentile(0.95)),
            p99_latency_ms: ms(entry.percentile(0.99)),
            avg_content_length: entry.avg_content_length(),
            current_rps: entry.current_rps(),
            current_fail_per_sec: entry.current_fail_per_sec(),
            fail_ratio: entry.fail_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureReport {
    pub name: String,
    pub reason: String,
    pub occurrences: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionReport {
    pub task: String,
    pub message: String,
    pub occurrences: u64,
}

/// Point-in-time report: `{timestamp, per-name entries, totals, user count}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStats {
    pub timestamp: DateTime<Utc>,
    pub user_count: usize,
    pub requests: Vec<RequestReport>,
    pub total: RequestReport,
    pub failures: Vec<FailureReport>,
    pub exceptions: Vec<ExceptionReport>,
}

impl ReportStats {
    pub fn from_snapshot(snapshot: &StatsSnapshot, user_count: usize) -> Self {
        let requests = snapshot
            .entries()
            .values()
            .map(RequestReport::from_entry)
            .collect();
        let failures = snapshot
            .failures()
            .into_iter()
            .map(|((name, reason), occurrences)| FailureReport {
                name,
                reason,
                occurrences,
            })
            .collect();
        let exceptions = snapshot
            .exceptions()
            .into_iter()
            .map(|((task, message), occurrences)| ExceptionReport {
                task,
                message,
                occurrences,
            })
            .collect();

        Self {
            timestamp: Utc::now(),
            user_count,
            requests,
            total: RequestReport::from_entry(&snapshot.total()),
            failures,
            exceptions,
        }
    }

    pub fn request(&self, name: &str) -> Option<&RequestReport> {
        self.requests.iter().find(|r| r.name == name)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{RequestSample, StatsWindow};
    use std::time::Duration;

    #[test]
    fn test_report_generation() {
        let w = StatsWindow::new("local");
        w.record(&RequestSample::success("req1", Duration::from_millis(100), 512));
        w.record(&RequestSample::failure("req1", Duration::from_millis(300), "HTTP 503"));
        w.record_exception("browse", "missing field");

        let report = ReportStats::from_snapshot(&w.snapshot(), 7);
        assert_eq!(report.user_count, 7);
        assert_eq!(report.total.name, "Aggregated");
        assert_eq!(report.total.num_requests, 2);
        assert_eq!(report.total.avg_latency_ms, 200.0);
        assert_eq!(report.total.min_latency_ms, 100.0);
        assert_eq!(report.total.max_latency_ms, 300.0);
        assert_eq!(report.request("req1").unwrap().fail_ratio, 0.5);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].reason, "HTTP 503");
        assert_eq!(report.exceptions[0].task, "browse");

        let json = report.to_json();
        assert!(json.contains("\"user_count\": 7"));
        assert!(json.contains("\"avg_latency_ms\": 200.0"));
    }

    #[test]
    fn test_report_empty() {
        let report = ReportStats::from_snapshot(&StatsSnapshot::default(), 0);
        assert!(report.requests.is_empty());
        assert_eq!(report.total.num_requests, 0);
        assert_eq!(report.total.avg_latency_ms, 0.0);
        assert_eq!(report.total.p99_latency_ms, 0.0);
    }
}
