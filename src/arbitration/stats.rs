use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::clock::SharedClock;
use crate::models::{ProviderId, ProviderStats};

/// Bounded number of call outcomes kept per provider.
const OUTCOME_WINDOW: usize = 1000;

/// Bounded latency sample reservoir per provider.
const LATENCY_WINDOW: usize = 256;

/// Rolling observation record for one provider.
#[derive(Debug)]
struct ProviderRecord {
    /// true = success, false = failure; newest at the back.
    outcomes: VecDeque<bool>,
    latencies: VecDeque<Duration>,
    last_update: Option<DateTime<Utc>>,
    rate_limited_until: Option<DateTime<Utc>>,
    /// Seeded from the provider's own health report.
    uptime_24h: f64,
    completeness: f64,
}

impl ProviderRecord {
    fn new() -> Self {
        Self {
            outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            last_update: None,
            rate_limited_until: None,
            uptime_24h: 1.0,
            completeness: 1.0,
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.outcomes.len() == OUTCOME_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn reliability(&self) -> f64 {
        if self.outcomes.is_empty() {
            // No history yet: neutral-optimistic so new providers get tried.
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|s| **s).count();
        successes as f64 / self.outcomes.len() as f64
    }

    fn latency_p95(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    }
}

/// Process-wide per-provider statistics. One instance shared by every
/// arbitration call; updates are entry-atomic via the dashmap shard lock,
/// never cross-provider read-modify-write.
pub struct ScoreTracker {
    records: DashMap<ProviderId, ProviderRecord>,
    clock: SharedClock,
}

impl ScoreTracker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Record a successful fetch: outcome, latency sample, freshness.
    pub fn record_success(&self, id: &str, latency: Duration, source_timestamp: DateTime<Utc>) {
        let mut rec = self
            .records
            .entry(id.to_string())
            .or_insert_with(ProviderRecord::new);
        rec.push_outcome(true);
        if rec.latencies.len() == LATENCY_WINDOW {
            rec.latencies.pop_front();
        }
        rec.latencies.push_back(latency);
        // Freshness tracks the newest data the provider has shown us.
        if rec.last_update.map_or(true, |t| source_timestamp > t) {
            rec.last_update = Some(source_timestamp);
        }
        rec.rate_limited_until = None;
    }

    /// Record a failed fetch attempt so scoring reflects recent behavior.
    pub fn record_failure(&self, id: &str) {
        let mut rec = self
            .records
            .entry(id.to_string())
            .or_insert_with(ProviderRecord::new);
        rec.push_outcome(false);
        debug!(provider = id, reliability = rec.reliability(), "recorded provider failure");
    }

    /// Provider asked us to back off until the given time.
    pub fn record_rate_limit(&self, id: &str, retry_after: Option<Duration>) {
        let until = self.clock.now()
            + chrono::Duration::from_std(retry_after.unwrap_or(Duration::from_secs(60)))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut rec = self
            .records
            .entry(id.to_string())
            .or_insert_with(ProviderRecord::new);
        rec.push_outcome(false);
        rec.rate_limited_until = Some(until);
    }

    /// Fold in the provider's self-reported health figures.
    pub fn record_health(&self, id: &str, uptime_24h: f64, completeness: f64) {
        let mut rec = self
            .records
            .entry(id.to_string())
            .or_insert_with(ProviderRecord::new);
        rec.uptime_24h = uptime_24h.clamp(0.0, 1.0);
        rec.completeness = completeness.clamp(0.0, 1.0);
    }

    pub fn is_rate_limited(&self, id: &str) -> bool {
        self.records
            .get(id)
            .and_then(|r| r.rate_limited_until)
            .map_or(false, |until| self.clock.now() < until)
    }

    /// Point-in-time copy of one provider's stats.
    pub fn snapshot(&self, id: &str) -> ProviderStats {
        let now = self.clock.now();
        match self.records.get(id) {
            Some(rec) => ProviderStats {
                provider_id: id.to_string(),
                freshness: rec
                    .last_update
                    .map(|t| (now - t).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(Duration::MAX),
                latency_p95: rec.latency_p95(),
                uptime_24h: rec.uptime_24h,
                completeness: rec.completeness,
                reliability: rec.reliability(),
                rate_limited_until: rec.rate_limited_until.filter(|until| now < *until),
            },
            None => ProviderStats {
                provider_id: id.to_string(),
                freshness: Duration::MAX,
                latency_p95: Duration::ZERO,
                uptime_24h: 1.0,
                completeness: 1.0,
                reliability: 1.0,
                rate_limited_until: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn tracker() -> (std::sync::Arc<ManualClock>, ScoreTracker) {
        let clock = ManualClock::starting_now();
        let tracker = ScoreTracker::new(clock.clone());
        (clock, tracker)
    }

    #[test]
    fn test_reliability_reflects_failures() {
        let (_clock, t) = tracker();
        for _ in 0..3 {
            t.record_success("alpha", Duration::from_millis(50), Utc::now());
        }
        t.record_failure("alpha");
        let snap = t.snapshot("alpha");
        assert!((snap.reliability - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_outcome_window_is_bounded() {
        let (_clock, t) = tracker();
        for _ in 0..OUTCOME_WINDOW {
            t.record_failure("alpha");
        }
        // A full window of failures then one success: reliability is 1/1000,
        // not diluted by evicted history.
        t.record_success("alpha", Duration::from_millis(10), Utc::now());
        let snap = t.snapshot("alpha");
        assert!((snap.reliability - 1.0 / OUTCOME_WINDOW as f64).abs() < 1e-9);
    }

    #[test]
    fn test_latency_p95() {
        let (_clock, t) = tracker();
        for ms in 1..=100u64 {
            t.record_success("alpha", Duration::from_millis(ms), Utc::now());
        }
        let snap = t.snapshot("alpha");
        assert_eq!(snap.latency_p95, Duration::from_millis(95));
    }

    #[test]
    fn test_rate_limit_expires_with_clock() {
        let (clock, t) = tracker();
        t.record_rate_limit("alpha", Some(Duration::from_secs(30)));
        assert!(t.is_rate_limited("alpha"));
        clock.advance(Duration::from_secs(31));
        assert!(!t.is_rate_limited("alpha"));
    }

    #[test]
    fn test_unknown_provider_gets_neutral_snapshot() {
        let (_clock, t) = tracker();
        let snap = t.snapshot("ghost");
        assert_eq!(snap.freshness, Duration::MAX);
        assert!((snap.reliability - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_freshness_tracks_newest_update() {
        let (clock, t) = tracker();
        let ts = clock.now();
        t.record_success("alpha", Duration::from_millis(5), ts);
        clock.advance(Duration::from_secs(10));
        let snap = t.snapshot("alpha");
        assert_eq!(snap.freshness, Duration::from_secs(10));
    }
}
