use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::models::DataType;

/// Bounded lookup-latency reservoir per data type.
const LATENCY_SAMPLES: usize = 512;

#[derive(Default)]
struct TypeCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    latencies: Mutex<VecDeque<Duration>>,
}

/// Hit/miss counters and latency percentiles per data type, plus the
/// pollution ratio fed from backend eviction counters. Purely additive;
/// recording never blocks a cache operation beyond an atomic bump.
#[derive(Default)]
pub struct CacheAnalytics {
    by_type: DashMap<DataType, TypeCounters>,
}

/// Point-in-time report for one data type.
#[derive(Debug, Clone, Serialize)]
pub struct TypeReport {
    pub data_type: DataType,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub latency_p50: Duration,
    pub latency_p95: Duration,
    pub latency_p99: Duration,
}

impl CacheAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, data_type: DataType, latency: Duration) {
        let counters = self.by_type.entry(data_type).or_default();
        counters.hits.fetch_add(1, Ordering::Relaxed);
        push_latency(&counters.latencies, latency);
    }

    pub fn record_miss(&self, data_type: DataType, latency: Duration) {
        let counters = self.by_type.entry(data_type).or_default();
        counters.misses.fetch_add(1, Ordering::Relaxed);
        push_latency(&counters.latencies, latency);
    }

    pub fn hit_rate(&self, data_type: DataType) -> f64 {
        match self.by_type.get(&data_type) {
            Some(c) => {
                let hits = c.hits.load(Ordering::Relaxed);
                let total = hits + c.misses.load(Ordering::Relaxed);
                if total == 0 {
                    0.0
                } else {
                    hits as f64 / total as f64
                }
            }
            None => 0.0,
        }
    }

    pub fn report(&self, data_type: DataType) -> TypeReport {
        let (hits, misses, p50, p95, p99) = match self.by_type.get(&data_type) {
            Some(c) => {
                let hits = c.hits.load(Ordering::Relaxed);
                let misses = c.misses.load(Ordering::Relaxed);
                let samples = c.latencies.lock().unwrap();
                let mut sorted: Vec<Duration> = samples.iter().copied().collect();
                sorted.sort_unstable();
                (
                    hits,
                    misses,
                    percentile(&sorted, 0.50),
                    percentile(&sorted, 0.95),
                    percentile(&sorted, 0.99),
                )
            }
            None => (0, 0, Duration::ZERO, Duration::ZERO, Duration::ZERO),
        };
        let total = hits + misses;
        TypeReport {
            data_type,
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            latency_p50: p50,
            latency_p95: p95,
            latency_p99: p99,
        }
    }

    /// Fraction of evicted entries that were never read before eviction.
    /// A high value flags a misconfigured policy or TTL: the cache is
    /// churning entries nobody asked for again.
    pub fn pollution_ratio(evicted_total: u64, evicted_never_read: u64) -> f64 {
        if evicted_total == 0 {
            0.0
        } else {
            evicted_never_read as f64 / evicted_total as f64
        }
    }
}

fn push_latency(samples: &Mutex<VecDeque<Duration>>, latency: Duration) {
    let mut samples = samples.lock().unwrap();
    if samples.len() == LATENCY_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(latency);
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}
