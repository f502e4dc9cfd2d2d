use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::clock::SharedClock;
use crate::errors::EngineError;

use super::eviction::{EvictionPolicy, ProtectedKeys};
use super::{CacheEntry, CacheKey};

/// Storage contract behind each cache tier. The engine is agnostic to
/// whether this is process memory, a remote key-value store or a
/// time-series database; only this contract matters.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, EngineError>;

    async fn set(&self, key: CacheKey, entry: CacheEntry) -> Result<(), EngineError>;

    async fn delete(&self, key: &CacheKey) -> Result<bool, EngineError>;

    async fn exists(&self, key: &CacheKey) -> Result<bool, EngineError>;

    /// Pipelined multi-get. The result has one slot per input key, in
    /// input order; absent entries are `None`, never omitted.
    async fn get_many(&self, keys: &[CacheKey]) -> Result<Vec<Option<CacheEntry>>, EngineError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Pipelined multi-set. Returns how many entries were written.
    async fn set_many(&self, items: Vec<(CacheKey, CacheEntry)>) -> Result<usize, EngineError> {
        let mut written = 0;
        for (key, entry) in items {
            if self.set(key, entry).await.is_ok() {
                written += 1;
            }
        }
        Ok(written)
    }
}

pub type SharedBackend = Arc<dyn CacheBackend>;

/// In-process backend: capacity-bounded dashmap with pluggable eviction.
///
/// When full, an unprotected victim is selected by the policy and dropped.
/// If every resident entry is protected, the new write is rejected with
/// `CacheFullProtected` rather than silently evicting a protected key or
/// ignoring the protection list.
pub struct MemoryBackend {
    entries: DashMap<CacheKey, CacheEntry>,
    capacity: usize,
    policy: EvictionPolicy,
    protected: ProtectedKeys,
    clock: SharedClock,
    evicted_total: AtomicU64,
    evicted_never_read: AtomicU64,
}

impl MemoryBackend {
    pub fn new(
        capacity: usize,
        policy: EvictionPolicy,
        protected: ProtectedKeys,
        clock: SharedClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            capacity,
            policy,
            protected,
            clock,
            evicted_total: AtomicU64::new(0),
            evicted_never_read: AtomicU64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    /// Entries evicted without ever being read; the pollution numerator.
    pub fn evicted_never_read(&self) -> u64 {
        self.evicted_never_read.load(Ordering::Relaxed)
    }

    fn evict_one(&self) -> Result<(), EngineError> {
        // Snapshot the unprotected population for victim selection. The
        // map can shift underneath us; a stale pick just means evicting a
        // slightly suboptimal entry, which is fine.
        let candidates: Vec<(CacheKey, CacheEntry)> = self
            .entries
            .iter()
            .filter(|kv| !self.protected.is_protected(kv.key()))
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();
        let refs: Vec<(&CacheKey, &CacheEntry)> =
            candidates.iter().map(|(k, e)| (k, e)).collect();

        let victim = match self.policy.select_victim(&refs, self.clock.now()) {
            Some(v) => v.clone(),
            None => {
                warn!("cache full and every resident entry is protected; rejecting write");
                return Err(EngineError::CacheFullProtected);
            }
        };
        if let Some((_, entry)) = self.entries.remove(&victim) {
            self.evicted_total.fetch_add(1, Ordering::Relaxed);
            if entry.access_count == 0 {
                self.evicted_never_read.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, EngineError> {
        Ok(self.entries.get_mut(key).map(|mut kv| {
            kv.access_count += 1;
            kv.last_access = self.clock.now();
            kv.clone()
        }))
    }

    async fn set(&self, key: CacheKey, entry: CacheEntry) -> Result<(), EngineError> {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_one()?;
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, EngineError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, EngineError> {
        Ok(self.entries.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EvictionPolicyKind;
    use crate::models::{DataType, Payload};
    use std::time::Duration;

    fn key(symbol: &str) -> CacheKey {
        CacheKey::new(symbol, DataType::Price, None)
    }

    fn entry(clock: &ManualClock, value: f64) -> CacheEntry {
        CacheEntry::new(
            Payload::Price { value },
            clock.now(),
            Duration::from_secs(300),
        )
    }

    fn backend(capacity: usize, protected: &[&str]) -> (Arc<ManualClock>, Arc<MemoryBackend>) {
        let clock = ManualClock::starting_now();
        let backend = MemoryBackend::new(
            capacity,
            EvictionPolicy::new(EvictionPolicyKind::Lru, 0.5),
            ProtectedKeys::from_patterns(
                &protected.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            ),
            clock.clone(),
        );
        (clock, backend)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (clock, b) = backend(10, &[]);
        b.set(key("TSLA"), entry(&clock, 250.0)).await.unwrap();
        let got = b.get(&key("TSLA")).await.unwrap().unwrap();
        assert_eq!(got.payload, Payload::Price { value: 250.0 });
        assert_eq!(got.access_count, 1, "get bumps access count");
    }

    #[tokio::test]
    async fn test_get_many_preserves_order_and_absences() {
        let (clock, b) = backend(10, &[]);
        b.set(key("A"), entry(&clock, 1.0)).await.unwrap();
        b.set(key("C"), entry(&clock, 3.0)).await.unwrap();
        let got = b
            .get_many(&[key("A"), key("B"), key("C")])
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert!(got[0].is_some());
        assert!(got[1].is_none(), "absent key is represented, not omitted");
        assert!(got[2].is_some());
    }

    #[tokio::test]
    async fn test_eviction_skips_protected_keys() {
        let (clock, b) = backend(2, &["SPY:*"]);
        b.set(key("SPY"), entry(&clock, 400.0)).await.unwrap();
        clock.advance(Duration::from_secs(10));
        b.set(key("AAPL"), entry(&clock, 180.0)).await.unwrap();
        clock.advance(Duration::from_secs(10));
        // SPY is the LRU victim by idle time, but it is protected.
        b.set(key("MSFT"), entry(&clock, 410.0)).await.unwrap();

        assert!(b.exists(&key("SPY")).await.unwrap());
        assert!(!b.exists(&key("AAPL")).await.unwrap());
        assert!(b.exists(&key("MSFT")).await.unwrap());
        assert_eq!(b.evicted_total(), 1);
    }

    #[tokio::test]
    async fn test_write_rejected_when_all_protected() {
        let (clock, b) = backend(1, &["SPY:*"]);
        b.set(key("SPY"), entry(&clock, 400.0)).await.unwrap();
        let err = b.set(key("AAPL"), entry(&clock, 180.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::CacheFullProtected));
        assert!(b.exists(&key("SPY")).await.unwrap());
    }

    #[tokio::test]
    async fn test_pollution_counter() {
        let (clock, b) = backend(1, &[]);
        b.set(key("A"), entry(&clock, 1.0)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        // A was never read before being pushed out.
        b.set(key("B"), entry(&clock, 2.0)).await.unwrap();
        assert_eq!(b.evicted_total(), 1);
        assert_eq!(b.evicted_never_read(), 1);

        b.get(&key("B")).await.unwrap();
        clock.advance(Duration::from_secs(1));
        b.set(key("C"), entry(&clock, 3.0)).await.unwrap();
        assert_eq!(b.evicted_total(), 2);
        assert_eq!(b.evicted_never_read(), 1, "B had been read");
    }
}
