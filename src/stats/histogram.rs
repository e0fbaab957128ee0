//! Fixed-resolution latency histogram.
//!
//! Bucket table v1 (HDR log-linear layout):
//!
//! | parameter              | value                      |
//! |------------------------|----------------------------|
//! | unit                   | microseconds               |
//! | lowest discernible     | 1 µs                       |
//! | highest trackable      | 3 600 000 000 µs (1 hour)  |
//! | significant digits     | 2 (≤1% relative bucket width) |
//!
//! Each power-of-two range is split into equal sub-buckets, so the spacing is
//! logarithmic across ranges and linear inside one. Values above the highest
//! trackable value saturate into the top bucket. Two processes using the same
//! table version produce bucket-identical histograms, which is what makes
//! worker snapshots mergeable at the master.

use hdrhistogram::Histogram;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

use crate::error::SwarmError;

pub const BUCKET_TABLE_VERSION: u32 = 1;
pub const LOWEST_DISCERNIBLE_MICROS: u64 = 1;
pub const HIGHEST_TRACKABLE_MICROS: u64 = 60 * 60 * 1000 * 1000;
pub const SIGNIFICANT_FIGURES: u8 = 2;

#[derive(Clone)]
pub struct LatencyHistogram {
    inner: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            inner: Histogram::<u64>::new_with_bounds(
                LOWEST_DISCERNIBLE_MICROS,
                HIGHEST_TRACKABLE_MICROS,
                SIGNIFICANT_FIGURES,
            )
            .expect("v1 bucket table bounds are valid"),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.inner.saturating_record(micros.max(LOWEST_DISCERNIBLE_MICROS));
    }

    /// Add every bucket of `other` into `self`.
    pub fn absorb(&mut self, other: &LatencyHistogram) {
        // Same bucket table on both sides, so adding cannot go out of range.
        let _ = self.inner.add(&other.inner);
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Upper edge of the bucket holding quantile `q`, zero when empty.
    pub fn value_at_quantile(&self, q: f64) -> Duration {
        if self.inner.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.inner.value_at_quantile(q))
    }

    /// Sparse `(bucket_upper_micros, count)` pairs in ascending order.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        self.inner
            .iter_recorded()
            .map(|v| (v.value_iterated_to(), v.count_at_value()))
            .collect()
    }

    pub fn from_buckets(version: u32, buckets: &[(u64, u64)]) -> Result<Self, SwarmError> {
        if version != BUCKET_TABLE_VERSION {
            return Err(SwarmError::IncompatibleHistogram {
                expected: BUCKET_TABLE_VERSION,
                actual: version,
            });
        }
        let mut hist = Self::new();
        let high = hist.inner.high();
        for &(value, count) in buckets {
            // Bucket upper edges of the top range may sit above `high`; clamping
            // keeps them inside the same bucket.
            hist.inner
                .record_n(value.min(high), count)
                .map_err(|e| SwarmError::ProtocolViolation(format!("bad bucket {}: {:?}", value, e)))?;
        }
        Ok(hist)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for LatencyHistogram {
    fn eq(&self, other: &Self) -> bool {
        self.buckets() == other.buckets()
    }
}

impl fmt::Debug for LatencyHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatencyHistogram")
            .field("len", &self.len())
            .field("buckets", &self.buckets().len())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct HistogramWire {
    version: u32,
    buckets: Vec<(u64, u64)>,
}

impl Serialize for LatencyHistogram {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        HistogramWire {
            version: BUCKET_TABLE_VERSION,
            buckets: self.buckets(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LatencyHistogram {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = HistogramWire::deserialize(deserializer)?;
        LatencyHistogram::from_buckets(wire.version, &wire.buckets).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_within_bucket_error() {
        let mut h = LatencyHistogram::new();
        for i in 1..=100 {
            h.record(Duration::from_millis(i));
        }
        let p50 = h.value_at_quantile(0.5).as_micros() as u64;
        assert!((49_000..=51_000).contains(&p50), "P50 was {}", p50);
        let p99 = h.value_at_quantile(0.99).as_micros() as u64;
        assert!((98_000..=100_000).contains(&p99), "P99 was {}", p99);
    }

    #[test]
    fn test_empty_quantile_is_zero() {
        assert_eq!(LatencyHistogram::new().value_at_quantile(0.95), Duration::ZERO);
    }

    #[test]
    fn test_wire_form_preserves_buckets() {
        let mut h = LatencyHistogram::new();
        h.record(Duration::from_micros(3));
        h.record(Duration::from_millis(250));
        h.record(Duration::from_secs(2 * 3600)); // saturates
        let json = serde_json::to_string(&h).unwrap();
        let back: LatencyHistogram = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
        assert_eq!(back.len(), 3);
    }

    #[test]
    fn test_rejects_other_table_version() {
        let json = r#"{"version":2,"buckets":[[10,1]]}"#;
        let err = serde_json::from_str::<LatencyHistogram>(json).unwrap_err();
        assert!(err.to_string().contains("bucket table"));
    }

    #[test]
    fn test_absorb_matches_recording_everything_once() {
        let mut a = LatencyHistogram::new();
        let mut b = LatencyHistogram::new();
        let mut all = LatencyHistogram::new();
        for i in 0..50 {
            a.record(Duration::from_micros(i * 37 + 1));
            all.record(Duration::from_micros(i * 37 + 1));
        }
        for i in 0..50 {
            b.record(Duration::from_millis(i + 5));
            all.record(Duration::from_millis(i + 5));
        }
        a.absorb(&b);
        assert_eq!(a, all);
    }
}
