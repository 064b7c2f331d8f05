//! Histogram metrics for durations and payload sizes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A bucketed histogram with cumulative bucket counts.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum: AtomicU64, // f64 bits
    count: AtomicU64,
    max: AtomicU64, // f64 bits
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds.
    pub fn with_buckets(name: &'static str, help: &'static str, mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(f64::total_cmp);
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            name,
            help,
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Observe a value.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        update_f64(&self.sum, |sum| sum + value);
        update_f64(&self.max, |max| max.max(value));

        for (i, &upper) in self.buckets.iter().enumerate() {
            if value <= upper {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Observe a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Snapshot of the current data.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: f64::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
            max: f64::from_bits(self.max.load(Ordering::Relaxed)),
        }
    }
}

fn update_f64(cell: &AtomicU64, f: impl Fn(f64) -> f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = f(f64::from_bits(current)).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

/// A snapshot of histogram data.
#[derive(Debug, Clone, Default)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds.
    pub buckets: Vec<f64>,
    /// Count of observations <= each bucket bound.
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
    pub max: f64,
}

impl HistogramSnapshot {
    /// Mean of all observations.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::with_buckets("test_hist", "A test histogram", vec![0.1, 0.01, 1.0]);

        hist.observe(0.005);
        hist.observe(0.05);
        hist.observe(5.0);

        let snapshot = hist.snapshot();
        assert_eq!(snapshot.buckets, vec![0.01, 0.1, 1.0]);
        assert_eq!(snapshot.bucket_counts, vec![1, 2, 2]);
        assert_eq!(snapshot.count, 3);
        assert!((snapshot.sum - 5.055).abs() < 1e-9);
        assert_eq!(snapshot.max, 5.0);
    }

    #[test]
    fn test_observe_duration() {
        let hist = Histogram::with_buckets("durations", "Durations", vec![0.001, 0.1]);
        hist.observe_duration(Duration::from_millis(50));
        hist.observe_duration(Duration::from_millis(150));

        let snapshot = hist.snapshot();
        assert_eq!(snapshot.bucket_counts, vec![0, 1]);
        assert!((snapshot.mean() - 0.1).abs() < 1e-9);
    }
}
