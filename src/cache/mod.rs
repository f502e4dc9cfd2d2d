//! Two-tier (L1/L2) read-through cache with pluggable eviction,
//! predictive warming, batch refresh scheduling and hit/miss analytics.

pub mod analytics;
pub mod backend;
pub mod eviction;
pub mod scheduler;
pub mod tier;
pub mod ttl;
pub mod warmer;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::{Asset, DataType, Payload};

pub use analytics::CacheAnalytics;
pub use backend::{CacheBackend, MemoryBackend, SharedBackend};
pub use eviction::{EvictionPolicy, ProtectedKeys};
pub use scheduler::BatchScheduler;
pub use tier::CacheTier;
pub use ttl::TtlCalculator;
pub use warmer::{AccessPatterns, PredictiveWarmer};

/// Composite cache key: (symbol, data type, qualifier).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub symbol: String,
    pub data_type: DataType,
    /// Extra discriminator, e.g. a history window like "90d".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
}

impl CacheKey {
    pub fn new(symbol: &str, data_type: DataType, qualifier: Option<&str>) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            data_type,
            qualifier: qualifier.map(|q| q.to_string()),
        }
    }

    pub fn for_request(asset: &Asset, data_type: DataType, qualifier: Option<&str>) -> Self {
        Self::new(&asset.symbol, data_type, qualifier)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}:{}:{}", self.symbol, self.data_type, q),
            None => write!(f, "{}:{}", self.symbol, self.data_type),
        }
    }
}

/// One cached value plus the bookkeeping eviction policies read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: Payload,
    pub written_at: DateTime<Utc>,
    pub ttl: Duration,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(payload: Payload, written_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            payload,
            written_at,
            ttl,
            access_count: 0,
            last_access: written_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.written_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Alive within its TTL and within the caller's staleness bound.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_staleness: Duration) -> bool {
        let age = self.age(now);
        age < self.ttl && age < max_staleness
    }
}

/// Handle to a background maintenance loop. Dropping without `stop` leaves
/// the loop running until the runtime shuts down; `stop` cancels cleanly.
pub struct BackgroundHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    name: &'static str,
}

impl BackgroundHandle {
    pub fn new(name: &'static str, shutdown: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self {
            shutdown,
            handle,
            name,
        }
    }

    /// Signal the loop to exit and wait for it.
    pub async fn stop(self) {
        debug!(task = self.name, "stopping background loop");
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cache_key_display() {
        let key = CacheKey::new("tsla", DataType::History, Some("30d"));
        assert_eq!(key.to_string(), "TSLA:history:30d");
        let bare = CacheKey::new("AAPL", DataType::Price, None);
        assert_eq!(bare.to_string(), "AAPL:price");
    }

    #[test]
    fn test_entry_freshness_bounds() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let entry = CacheEntry::new(
            Payload::Price { value: 1.0 },
            t0,
            Duration::from_secs(60),
        );
        let near = t0 + chrono::Duration::seconds(30);
        let past_ttl = t0 + chrono::Duration::seconds(61);
        assert!(entry.is_fresh(near, Duration::from_secs(300)));
        // TTL expired even though the caller would tolerate the age.
        assert!(!entry.is_fresh(past_ttl, Duration::from_secs(300)));
        // Caller stricter than TTL.
        assert!(!entry.is_fresh(near, Duration::from_secs(10)));
    }
}
