//! Router statistics
//!
//! Lock-free counters, gauges and a latency histogram describing how bulk
//! writes were routed. A [`RouterStats`] sink is handed to the retry loop
//! explicitly; there is no process-wide registry.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries for round latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(upper bound, count)` pairs, ending with `+Inf`
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters describing bulk write routing
#[derive(Debug, Default)]
pub struct RouterStats {
    pub requests: Counter,
    pub rounds: Counter,
    pub batches_sent: Counter,
    pub ops_targeted: Counter,
    pub target_errors: Counter,
    pub stale_responses: Counter,
    pub shard_failures: Counter,
    pub refreshes: Counter,
    pub no_progress_aborts: Counter,
    pub fatal_aborts: Counter,
    /// Batches dispatched in the current round
    pub inflight_batches: Gauge,
    pub round_latency: Histogram,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_round(&self, duration: Duration) {
        self.rounds.inc();
        self.round_latency
            .observe(duration.as_secs_f64() * 1000.0);
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 10] = [
            ("requests_total", "Bulk write requests executed", &self.requests),
            ("rounds_total", "Targeting rounds", &self.rounds),
            ("batches_sent_total", "Child batches dispatched", &self.batches_sent),
            ("ops_targeted_total", "Writes placed into child batches", &self.ops_targeted),
            ("target_errors_total", "Operations that could not be targeted", &self.target_errors),
            ("stale_responses_total", "Stale routing responses from shards", &self.stale_responses),
            ("shard_failures_total", "Child batches without a shard reply", &self.shard_failures),
            ("refreshes_total", "Routing refreshes that changed metadata", &self.refreshes),
            (
                "no_progress_aborts_total",
                "Requests failed for lack of progress",
                &self.no_progress_aborts,
            ),
            ("fatal_aborts_total", "Requests aborted by fatal errors", &self.fatal_aborts),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP minibulk_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minibulk_{} counter", name);
            let _ = writeln!(out, "minibulk_{} {}", name, counter.get());
        }

        out.push_str("# HELP minibulk_inflight_batches Batches dispatched in the current round\n");
        out.push_str("# TYPE minibulk_inflight_batches gauge\n");
        let _ = writeln!(out, "minibulk_inflight_batches {}", self.inflight_batches.get());

        out.push_str("# HELP minibulk_round_duration_ms Round duration in milliseconds\n");
        out.push_str("# TYPE minibulk_round_duration_ms histogram\n");
        for (le, count) in self.round_latency.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "minibulk_round_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(
                    out,
                    "minibulk_round_duration_ms_bucket{{le=\"{}\"}} {}",
                    le, count
                );
            }
        }
        let _ = writeln!(out, "minibulk_round_duration_ms_sum {}", self.round_latency.sum());
        let _ = writeln!(out, "minibulk_round_duration_ms_count {}", self.round_latency.count());

        out
    }
}
