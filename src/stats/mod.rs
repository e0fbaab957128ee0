use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod histogram;
pub mod report;

pub use histogram::LatencyHistogram;
pub use report::{ExceptionReport, FailureReport, ReportStats, RequestReport};

/// Seconds of per-second request/failure counts kept on every entry.
pub const RPS_WINDOW_SECS: i64 = 20;
/// Seconds averaged for the "current" rates, ending one second before the newest.
pub const CURRENT_RATE_SECS: i64 = 10;
/// Reason recorded for requests abandoned after the stop grace period.
pub const CANCELLED_REASON: &str = "cancelled: abandoned after stop grace period";
/// Name of the synthetic entry that sums every request name.
pub const AGGREGATED_NAME: &str = "Aggregated";

pub type SharedStats = Arc<StatsWindow>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Outcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure { .. })
    }
}

/// One observed request. Produced by a virtual user, consumed by [`StatsWindow::record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: Outcome,
    pub size: u64,
}

impl RequestSample {
    pub fn success(name: impl Into<String>, duration: Duration, size: u64) -> Self {
        Self {
            name: name.into(),
            started_at: Utc::now(),
            duration,
            outcome: Outcome::Success,
            size,
        }
    }

    pub fn failure(name: impl Into<String>, duration: Duration, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started_at: Utc::now(),
            duration,
            outcome: Outcome::failure(reason),
            size: 0,
        }
    }

    pub fn cancelled(name: impl Into<String>, started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            started_at,
            duration,
            outcome: Outcome::failure(CANCELLED_REASON),
            size: 0,
        }
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self
    }
}

/// Cumulative statistics for one request name.
///
/// Every field combines with a commutative, associative rule (sum, min, max,
/// bucket-wise sum), so entries from any number of virtual users or
/// processes can be folded together in any order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub name: String,
    pub num_requests: u64,
    pub num_failures: u64,
    pub total_response_micros: u64,
    pub total_response_micros_sq: u128,
    pub min_response_micros: Option<u64>,
    pub max_response_micros: u64,
    pub total_content_length: u64,
    pub histogram: LatencyHistogram,
    /// reason -> occurrences
    pub failures: BTreeMap<String, u64>,
    /// unix second -> requests started in that second
    pub requests_per_sec: BTreeMap<i64, u64>,
    pub failures_per_sec: BTreeMap<i64, u64>,
    pub first_request_ms: Option<i64>,
    pub last_request_ms: Option<i64>,
}

impl StatsEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_requests: 0,
            num_failures: 0,
            total_response_micros: 0,
            total_response_micros_sq: 0,
            min_response_micros: None,
            max_response_micros: 0,
            total_content_length: 0,
            histogram: LatencyHistogram::new(),
            failures: BTreeMap::new(),
            requests_per_sec: BTreeMap::new(),
            failures_per_sec: BTreeMap::new(),
            first_request_ms: None,
            last_request_ms: None,
        }
    }

    pub fn record(&mut self, sample: &RequestSample) {
        let micros = u64::try_from(sample.duration.as_micros()).unwrap_or(u64::MAX);
        self.num_requests += 1;
        self.total_response_micros = self.total_response_micros.saturating_add(micros);
        self.total_response_micros_sq += u128::from(micros) * u128::from(micros);
        self.min_response_micros = Some(self.min_response_micros.map_or(micros, |m| m.min(micros)));
        self.max_response_micros = self.max_response_micros.max(micros);
        self.total_content_length += sample.size;
        self.histogram.record(sample.duration);

        let ms = sample.started_at.timestamp_millis();
        self.first_request_ms = Some(self.first_request_ms.map_or(ms, |f| f.min(ms)));
        self.last_request_ms = Some(self.last_request_ms.map_or(ms, |l| l.max(ms)));

        let second = sample.started_at.timestamp();
        *self.requests_per_sec.entry(second).or_insert(0) += 1;
        if let Outcome::Failure { reason } = &sample.outcome {
            self.num_failures += 1;
            *self.failures.entry(reason.clone()).or_insert(0) += 1;
            *self.failures_per_sec.entry(second).or_insert(0) += 1;
        }
        self.trim_windows();
    }

    /// Fold `other` into `self`. The name of `self` is kept.
    pub fn absorb(&mut self, other: &StatsEntry) {
        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_micros = self
            .total_response_micros
            .saturating_add(other.total_response_micros);
        self.total_response_micros_sq += other.total_response_micros_sq;
        self.min_response_micros = match (self.min_response_micros, other.min_response_micros) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_response_micros = self.max_response_micros.max(other.max_response_micros);
        self.total_content_length += other.total_content_length;
        self.histogram.absorb(&other.histogram);
        for (reason, count) in &other.failures {
            *self.failures.entry(reason.clone()).or_insert(0) += count;
        }
        for (second, count) in &other.requests_per_sec {
            *self.requests_per_sec.entry(*second).or_insert(0) += count;
        }
        for (second, count) in &other.failures_per_sec {
            *self.failures_per_sec.entry(*second).or_insert(0) += count;
        }
        self.first_request_ms = min_opt(self.first_request_ms, other.first_request_ms);
        self.last_request_ms = max_opt(self.last_request_ms, other.last_request_ms);
        self.trim_windows();
    }

    fn trim_windows(&mut self) {
        // Both maps are anchored on the newest request second so trimming is
        // order-independent.
        if let Some(&newest) = self.requests_per_sec.keys().next_back() {
            let oldest_kept = newest - RPS_WINDOW_SECS + 1;
            self.requests_per_sec = self.requests_per_sec.split_off(&oldest_kept);
            self.failures_per_sec = self.failures_per_sec.split_off(&oldest_kept);
        }
    }

    pub fn avg_response_time(&self) -> Duration {
        if self.num_requests == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_response_micros / self.num_requests)
    }

    pub fn avg_response_millis(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        self.total_response_micros as f64 / self.num_requests as f64 / 1000.0
    }

    /// Population standard deviation of response times, in milliseconds.
    pub fn stddev_response_millis(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        let n = self.num_requests as f64;
        let mean = self.total_response_micros as f64 / n;
        let variance = (self.total_response_micros_sq as f64 / n - mean * mean).max(0.0);
        variance.sqrt() / 1000.0
    }

    pub fn avg_content_length(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        self.total_content_length as f64 / self.num_requests as f64
    }

    pub fn fail_ratio(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        self.num_failures as f64 / self.num_requests as f64
    }

    pub fn percentile(&self, q: f64) -> Duration {
        self.histogram.value_at_quantile(q)
    }

    pub fn current_rps(&self) -> f64 {
        current_rate(&self.requests_per_sec)
    }

    pub fn current_fail_per_sec(&self) -> f64 {
        // Anchor on the request timeline so both rates cover the same seconds.
        match self.requests_per_sec.keys().next_back() {
            Some(&newest) => rate_ending_before(&self.failures_per_sec, newest),
            None => 0.0,
        }
    }
}

fn current_rate(per_sec: &BTreeMap<i64, u64>) -> f64 {
    match per_sec.keys().next_back() {
        Some(&newest) => rate_ending_before(per_sec, newest),
        None => 0.0,
    }
}

fn rate_ending_before(per_sec: &BTreeMap<i64, u64>, newest: i64) -> f64 {
    let total: u64 = per_sec
        .range(newest - CURRENT_RATE_SECS..newest)
        .map(|(_, count)| count)
        .sum();
    total as f64 / CURRENT_RATE_SECS as f64
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Everything one process has recorded since its last stats reset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceStats {
    /// Incremented on every reset.
    pub epoch: u64,
    /// Incremented on every snapshot within an epoch.
    pub seq: u64,
    pub entries: BTreeMap<String, StatsEntry>,
    /// task -> message -> occurrences
    pub exceptions: BTreeMap<String, BTreeMap<String, u64>>,
}

impl SourceStats {
    fn num_requests(&self) -> u64 {
        self.entries.values().map(|e| e.num_requests).sum()
    }

    fn num_exceptions(&self) -> u64 {
        self.exceptions.values().flat_map(|m| m.values()).sum()
    }

    /// Cumulative snapshots from one source only grow, so the newest one
    /// subsumes every older one. Ties past `(epoch, seq)` fall back to the
    /// counts, which keeps the choice independent of argument order.
    fn newer(&self, other: &SourceStats) -> CmpOrdering {
        (self.epoch, self.seq, self.num_requests(), self.num_exceptions()).cmp(&(
            other.epoch,
            other.seq,
            other.num_requests(),
            other.num_exceptions(),
        ))
    }
}

/// Immutable, mergeable view of cumulative statistics keyed by source.
///
/// `merge` keeps the newest cumulative snapshot of every source, which makes
/// it commutative, associative and idempotent: re-delivered or reordered
/// heartbeats never double count.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sources: BTreeMap<String, SourceStats>,
}

impl StatsSnapshot {
    pub fn merge(&self, other: &StatsSnapshot) -> StatsSnapshot {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    pub fn merge_from(&mut self, other: &StatsSnapshot) {
        for (source, incoming) in &other.sources {
            match self.sources.get_mut(source) {
                Some(current) => {
                    if incoming.newer(current) == CmpOrdering::Greater {
                        *current = incoming.clone();
                    }
                }
                None => {
                    self.sources.insert(source.clone(), incoming.clone());
                }
            }
        }
    }

    /// Per-name entries summed across sources.
    pub fn entries(&self) -> BTreeMap<String, StatsEntry> {
        let mut combined: BTreeMap<String, StatsEntry> = BTreeMap::new();
        for source in self.sources.values() {
            for (name, entry) in &source.entries {
                combined
                    .entry(name.clone())
                    .or_insert_with(|| StatsEntry::new(name.clone()))
                    .absorb(entry);
            }
        }
        combined
    }

    pub fn total(&self) -> StatsEntry {
        let mut total = StatsEntry::new(AGGREGATED_NAME);
        for source in self.sources.values() {
            for entry in source.entries.values() {
                total.absorb(entry);
            }
        }
        total
    }

    /// `(name, reason) -> occurrences` across all sources.
    pub fn failures(&self) -> BTreeMap<(String, String), u64> {
        let mut failures = BTreeMap::new();
        for source in self.sources.values() {
            for (name, entry) in &source.entries {
                for (reason, count) in &entry.failures {
                    *failures.entry((name.clone(), reason.clone())).or_insert(0) += count;
                }
            }
        }
        failures
    }

    /// `(task, message) -> occurrences` across all sources.
    pub fn exceptions(&self) -> BTreeMap<(String, String), u64> {
        let mut exceptions = BTreeMap::new();
        for source in self.sources.values() {
            for (task, messages) in &source.exceptions {
                for (message, count) in messages {
                    *exceptions.entry((task.clone(), message.clone())).or_insert(0) += count;
                }
            }
        }
        exceptions
    }

    pub fn num_requests(&self) -> u64 {
        self.sources.values().map(|s| s.num_requests()).sum()
    }

    pub fn num_failures(&self) -> u64 {
        self.sources
            .values()
            .flat_map(|s| s.entries.values())
            .map(|e| e.num_failures)
            .sum()
    }

    pub fn source(&self, id: &str) -> Option<&SourceStats> {
        self.sources.get(id)
    }
}

/// Sharded, per-process statistics sink.
///
/// Request names hash onto a fixed set of shards; `record` only holds the
/// lock of the shard owning its name, so virtual users recording different
/// names never contend and no lock spans more than one entry update.
pub struct StatsWindow {
    source: String,
    shards: Vec<Mutex<HashMap<String, StatsEntry>>>,
    exceptions: Mutex<BTreeMap<String, BTreeMap<String, u64>>>,
    epoch: AtomicU64,
    seq: AtomicU64,
    // Serializes snapshot/reset so sequence numbers follow content order.
    snapshot_lock: Mutex<()>,
}

impl StatsWindow {
    pub const DEFAULT_SHARDS: usize = 16;

    pub fn new(source: impl Into<String>) -> Self {
        Self::with_shards(source, Self::DEFAULT_SHARDS)
    }

    pub fn with_shards(source: impl Into<String>, num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            source: source.into(),
            shards,
            exceptions: Mutex::new(BTreeMap::new()),
            epoch: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            snapshot_lock: Mutex::new(()),
        }
    }

    pub fn shared(source: impl Into<String>) -> SharedStats {
        Arc::new(Self::new(source))
    }

    pub fn source_id(&self) -> &str {
        &self.source
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn shard_for(&self, name: &str) -> &Mutex<HashMap<String, StatsEntry>> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn record(&self, sample: &RequestSample) {
        let mut shard = self.shard_for(&sample.name).lock();
        match shard.get_mut(&sample.name) {
            Some(entry) => entry.record(sample),
            None => {
                let mut entry = StatsEntry::new(sample.name.clone());
                entry.record(sample);
                shard.insert(sample.name.clone(), entry);
            }
        }
    }

    /// Count an error raised by task code (not by the target system).
    pub fn record_exception(&self, task: &str, message: &str) {
        let mut exceptions = self.exceptions.lock();
        *exceptions
            .entry(task.to_string())
            .or_default()
            .entry(message.to_string())
            .or_insert(0) += 1;
    }

    /// Cumulative view of everything recorded since the last reset.
    ///
    /// Shards are copied one at a time, so concurrent `record` calls are
    /// never blocked for longer than one shard copy.
    pub fn snapshot(&self) -> StatsSnapshot {
        let _guard = self.snapshot_lock.lock();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        let mut entries = BTreeMap::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for (name, entry) in shard.iter() {
                entries.insert(name.clone(), entry.clone());
            }
        }
        let exceptions = self.exceptions.lock().clone();

        let mut sources = BTreeMap::new();
        sources.insert(
            self.source.clone(),
            SourceStats {
                epoch: self.epoch(),
                seq,
                entries,
                exceptions,
            },
        );
        StatsSnapshot { sources }
    }

    /// Drop everything and start a new epoch.
    pub fn reset(&self) {
        let _guard = self.snapshot_lock.lock();
        for shard in &self.shards {
            shard.lock().clear();
        }
        self.exceptions.lock().clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.seq.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(second: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + second, 0).unwrap()
    }

    fn ok(name: &str, millis: u64) -> RequestSample {
        RequestSample::success(name, Duration::from_millis(millis), 100).started_at(at(0))
    }

    fn window_with(source: &str, samples: &[RequestSample]) -> StatsSnapshot {
        let w = StatsWindow::new(source);
        for s in samples {
            w.record(s);
        }
        w.snapshot()
    }

    #[test]
    fn test_entry_math() {
        let mut e = StatsEntry::new("home");
        e.record(&ok("home", 100));
        e.record(&ok("home", 200));
        assert_eq!(e.num_requests, 2);
        assert_eq!(e.total_response_micros, 300_000);
        assert_eq!(e.min_response_micros, Some(100_000));
        assert_eq!(e.max_response_micros, 200_000);
        assert_eq!(e.avg_response_millis(), 150.0);
        assert!((e.stddev_response_millis() - 50.0).abs() < 1e-6);
        assert_eq!(e.avg_content_length(), 100.0);
    }

    #[test]
    fn test_failures_grouped_by_reason() {
        let w = StatsWindow::new("local");
        w.record(&ok("login", 10));
        w.record(&RequestSample::failure("login", Duration::from_millis(5), "HTTP 500"));
        w.record(&RequestSample::failure("login", Duration::from_millis(5), "HTTP 500"));
        w.record(&RequestSample::failure("login", Duration::from_millis(5), "timeout"));
        let snap = w.snapshot();
        let failures = snap.failures();
        assert_eq!(failures[&("login".to_string(), "HTTP 500".to_string())], 2);
        assert_eq!(failures[&("login".to_string(), "timeout".to_string())], 1);
        assert_eq!(snap.num_failures(), 3);
        assert_eq!(snap.total().fail_ratio(), 0.75);
    }

    #[test]
    fn test_rps_window_is_trimmed() {
        let mut e = StatsEntry::new("poll");
        for s in 0..30 {
            e.record(&RequestSample::success("poll", Duration::from_millis(1), 0).started_at(at(s)));
        }
        assert_eq!(e.requests_per_sec.len(), RPS_WINDOW_SECS as usize);
        assert_eq!(*e.requests_per_sec.keys().next().unwrap(), 1_700_000_000 + 10);
        // 10 full seconds of one request each before the newest second.
        assert!((e.current_rps() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_is_cumulative_and_monotonic() {
        let w = StatsWindow::new("w1");
        w.record(&ok("a", 1));
        let first = w.snapshot();
        w.record(&ok("a", 1));
        let second = w.snapshot();
        let (s1, s2) = (&first.sources["w1"], &second.sources["w1"]);
        assert!(s2.seq > s1.seq);
        assert_eq!(s1.entries["a"].num_requests, 1);
        assert_eq!(s2.entries["a"].num_requests, 2);
        // older snapshot arriving late does not roll back
        assert_eq!(second.merge(&first), second);
    }

    #[test]
    fn test_merge_commutative_and_associative() {
        let a = window_with("w1", &[ok("a", 10), ok("b", 20)]);
        let b = window_with("w2", &[ok("a", 30), RequestSample::failure("b", Duration::from_millis(1), "x").started_at(at(3))]);
        let c = window_with("w3", &[ok("c", 5), ok("a", 7000)]);

        let left = a.merge(&b).merge(&c);
        let right = a.merge(&b.merge(&c));
        let swapped = a.merge(&c).merge(&b);
        assert_eq!(left, right);
        assert_eq!(left, swapped);
        assert_eq!(a.merge(&b), b.merge(&a));

        let totals = left.entries();
        assert_eq!(totals["a"].num_requests, 3);
        assert_eq!(totals["b"].num_failures, 1);
        assert_eq!(left.total().num_requests, 6);
    }

    #[test]
    fn test_merge_idempotent() {
        let a = window_with("w1", &[ok("a", 10), ok("a", 12)]);
        let b = window_with("w2", &[ok("a", 30)]);
        let s = a.merge(&b);
        assert_eq!(s.merge(&s), s);
        assert_eq!(s.merge(&a), s);
        assert_eq!(s.num_requests(), 3);
    }

    #[test]
    fn test_entry_absorb_associative_with_windows() {
        let mk = |seconds: &[i64]| {
            let mut e = StatsEntry::new("x");
            for s in seconds {
                e.record(&RequestSample::success("x", Duration::from_millis(3), 1).started_at(at(*s)));
            }
            e
        };
        let (a, b, c) = (mk(&[0, 1, 2]), mk(&[15, 16]), mk(&[40, 41]));
        let mut left = a.clone();
        left.absorb(&b);
        left.absorb(&c);
        let mut bc = b.clone();
        bc.absorb(&c);
        let mut right = a.clone();
        right.absorb(&bc);
        assert_eq!(left, right);
    }

    #[test]
    fn test_reset_starts_new_epoch() {
        let w = StatsWindow::new("w1");
        w.record(&ok("a", 1));
        let before = w.snapshot();
        w.reset();
        w.record(&ok("b", 1));
        let after = w.snapshot();
        assert_eq!(after.sources["w1"].epoch, 1);
        assert!(!after.sources["w1"].entries.contains_key("a"));
        // post-reset snapshot supersedes the larger pre-reset one
        assert_eq!(before.merge(&after), after);
        assert_eq!(after.merge(&before), after);
    }

    #[test]
    fn test_exceptions_counted() {
        let w = StatsWindow::new("w1");
        w.record_exception("checkout", "index out of bounds");
        w.record_exception("checkout", "index out of bounds");
        let ex = w.snapshot().exceptions();
        assert_eq!(ex[&("checkout".to_string(), "index out of bounds".to_string())], 2);
    }

    #[test]
    fn test_concurrent_record_and_snapshot() {
        let w = Arc::new(StatsWindow::with_shards("w1", 4));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let w = w.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        w.record(&ok(&format!("req{}", (t + i) % 5), 1));
                        if i % 100 == 0 {
                            let _ = w.snapshot();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(w.snapshot().num_requests(), 8000);
    }

    #[test]
    fn test_snapshot_wire_roundtrip() {
        let snap = window_with("w1", &[ok("a", 10), RequestSample::failure("b", Duration::from_millis(2), "boom").started_at(at(1))]);
        let json = serde_json::to_string(&snap).unwrap();
        let back: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
