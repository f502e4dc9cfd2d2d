use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::errors::EngineError;
use crate::models::{AssetClass, Payload};

use super::analytics::CacheAnalytics;
use super::backend::SharedBackend;
use super::ttl::TtlCalculator;
use super::warmer::AccessPatterns;
use super::{CacheEntry, CacheKey};

/// Result shape broadcast to single-flight followers. `EngineError` is
/// `Clone`, so followers see the leader's failure unaltered.
type FlightResult = Result<Payload, EngineError>;

/// L1/L2 read-through, write-through cache with single-flight fetch
/// deduplication. A backend failure on either tier degrades to a miss;
/// the cache is an optimization, never a correctness dependency.
pub struct CacheTier {
    l1: SharedBackend,
    l2: SharedBackend,
    ttl: TtlCalculator,
    analytics: Arc<CacheAnalytics>,
    patterns: Arc<AccessPatterns>,
    clock: SharedClock,
    inflight: DashMap<String, broadcast::Sender<FlightResult>>,
}

impl CacheTier {
    pub fn new(
        l1: SharedBackend,
        l2: SharedBackend,
        ttl: TtlCalculator,
        analytics: Arc<CacheAnalytics>,
        patterns: Arc<AccessPatterns>,
        clock: SharedClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            l1,
            l2,
            ttl,
            analytics,
            patterns,
            clock,
            inflight: DashMap::new(),
        })
    }

    pub fn analytics(&self) -> &Arc<CacheAnalytics> {
        &self.analytics
    }

    pub fn patterns(&self) -> &Arc<AccessPatterns> {
        &self.patterns
    }

    /// Read through L1 then L2. An L2 hit is promoted into L1 so the next
    /// read is fast. Freshness respects both entry TTL and the caller's
    /// `max_staleness`.
    pub async fn get(&self, key: &CacheKey, max_staleness: Duration) -> Option<Payload> {
        let started = Instant::now();
        let now = self.clock.now();
        self.patterns.record_access(key, now);

        match self.l1.get(key).await {
            Ok(Some(entry)) if entry.is_fresh(now, max_staleness) => {
                self.analytics.record_hit(key.data_type, started.elapsed());
                return Some(entry.payload);
            }
            Ok(_) => {}
            Err(err) => warn!(%key, %err, "L1 get failed, degrading to L2"),
        }

        match self.l2.get(key).await {
            Ok(Some(entry)) if entry.is_fresh(now, max_staleness) => {
                // Promote for the next reader; remaining lifetime carries over.
                let remaining = entry.ttl.saturating_sub(entry.age(now));
                let promoted = CacheEntry::new(entry.payload.clone(), entry.written_at, entry.ttl);
                if remaining > Duration::ZERO {
                    if let Err(err) = self.l1.set(key.clone(), promoted).await {
                        warn!(%key, %err, "L1 promotion failed");
                    }
                }
                self.analytics.record_hit(key.data_type, started.elapsed());
                return Some(entry.payload);
            }
            Ok(_) => {}
            Err(err) => warn!(%key, %err, "L2 get failed, treating as miss"),
        }

        self.analytics.record_miss(key.data_type, started.elapsed());
        None
    }

    /// Write both tiers. L1 is always synchronous. L2 is synchronous for
    /// durable data types (anything used for audit) and fire-and-forget
    /// for the rest, where losing a write only costs a refetch.
    pub async fn set(&self, key: CacheKey, payload: Payload, ttl: Duration) {
        let entry = CacheEntry::new(payload, self.clock.now(), ttl);

        if let Err(err) = self.l1.set(key.clone(), entry.clone()).await {
            warn!(%key, %err, "L1 set failed");
        }

        if key.data_type.requires_durable_write() {
            if let Err(err) = self.l2.set(key.clone(), entry).await {
                warn!(%key, %err, "durable L2 set failed");
            }
        } else {
            let l2 = self.l2.clone();
            let key2 = key.clone();
            tokio::spawn(async move {
                if let Err(err) = l2.set(key2.clone(), entry).await {
                    warn!(key = %key2, %err, "async L2 set failed");
                }
            });
        }
    }

    /// `set` with the TTL derived from data type, asset class and the
    /// current market session.
    pub async fn set_auto_ttl(&self, key: CacheKey, class: AssetClass, payload: Payload) {
        let ttl = self.ttl.ttl_for(class, key.data_type, self.clock.now());
        self.set(key, payload, ttl).await;
    }

    /// Batched read: one slot per input key, input order preserved,
    /// absences represented as `None`. Each slot counts toward hit-rate
    /// analytics and warming priority exactly like a single `get`.
    pub async fn get_many(&self, keys: &[CacheKey], max_staleness: Duration) -> Vec<Option<Payload>> {
        let started = Instant::now();
        let now = self.clock.now();
        for key in keys {
            self.patterns.record_access(key, now);
        }
        let fresh_only = |entry: Option<CacheEntry>| {
            entry.and_then(|e| e.is_fresh(now, max_staleness).then_some(e.payload))
        };

        let mut out: Vec<Option<Payload>> = match self.l1.get_many(keys).await {
            Ok(entries) => entries.into_iter().map(fresh_only).collect(),
            Err(err) => {
                warn!(%err, "L1 get_many failed, degrading to L2");
                vec![None; keys.len()]
            }
        };

        let missing: Vec<usize> = (0..keys.len()).filter(|i| out[*i].is_none()).collect();
        if !missing.is_empty() {
            let l2_keys: Vec<CacheKey> = missing.iter().map(|i| keys[*i].clone()).collect();
            match self.l2.get_many(&l2_keys).await {
                Ok(entries) => {
                    let mut promotions = Vec::new();
                    for (slot, entry) in missing.iter().zip(entries) {
                        if let Some(entry) = entry {
                            if entry.is_fresh(now, max_staleness) {
                                promotions.push((
                                    keys[*slot].clone(),
                                    CacheEntry::new(
                                        entry.payload.clone(),
                                        entry.written_at,
                                        entry.ttl,
                                    ),
                                ));
                                out[*slot] = Some(entry.payload);
                            }
                        }
                    }
                    if !promotions.is_empty() {
                        if let Err(err) = self.l1.set_many(promotions).await {
                            warn!(%err, "L1 batch promotion failed");
                        }
                    }
                }
                Err(err) => warn!(%err, "L2 get_many failed, treating as misses"),
            }
        }

        let elapsed = started.elapsed();
        for (key, slot) in keys.iter().zip(&out) {
            if slot.is_some() {
                self.analytics.record_hit(key.data_type, elapsed);
            } else {
                self.analytics.record_miss(key.data_type, elapsed);
            }
        }
        out
    }

    /// Batched write-through. Returns how many entries landed in L1.
    /// L2 writes follow the same durability split as `set`: durable data
    /// types land in L2 before this returns, the rest are fire-and-forget.
    pub async fn set_many(&self, items: Vec<(CacheKey, Payload, Duration)>) -> usize {
        let now = self.clock.now();
        let entries: Vec<(CacheKey, CacheEntry)> = items
            .into_iter()
            .map(|(key, payload, ttl)| (key, CacheEntry::new(payload, now, ttl)))
            .collect();

        let (durable, lossy): (Vec<_>, Vec<_>) = entries
            .clone()
            .into_iter()
            .partition(|(key, _)| key.data_type.requires_durable_write());

        if !durable.is_empty() {
            if let Err(err) = self.l2.set_many(durable).await {
                warn!(%err, "durable L2 set_many failed");
            }
        }
        if !lossy.is_empty() {
            let l2 = self.l2.clone();
            tokio::spawn(async move {
                if let Err(err) = l2.set_many(lossy).await {
                    warn!(%err, "async L2 set_many failed");
                }
            });
        }

        match self.l1.set_many(entries).await {
            Ok(written) => written,
            Err(err) => {
                warn!(%err, "L1 set_many failed");
                0
            }
        }
    }

    /// Read-through with single-flight miss handling: for a given key only
    /// one upstream fetch runs at a time, concurrent callers await that
    /// fetch's result instead of stampeding the source. On success the
    /// value is written back with a dynamic TTL before followers wake.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &CacheKey,
        class: AssetClass,
        max_staleness: Duration,
        fetch: F,
    ) -> Result<Payload, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Payload, EngineError>>,
    {
        if let Some(payload) = self.get(key, max_staleness).await {
            return Ok(payload);
        }

        let flight_key = key.to_string();
        let sender = {
            use dashmap::mapref::entry::Entry;
            match self.inflight.entry(flight_key.clone()) {
                Entry::Occupied(occupied) => {
                    // Another caller is already fetching this key: wait on it.
                    let mut rx = occupied.get().subscribe();
                    drop(occupied);
                    debug!(%key, "joining in-flight fetch");
                    return match rx.recv().await {
                        Ok(Ok(payload)) => Ok(payload),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(EngineError::Internal(
                            "in-flight fetch abandoned".into(),
                        )),
                    };
                }
                Entry::Vacant(vacant) => {
                    let (tx, _) = broadcast::channel(1);
                    vacant.insert(tx.clone());
                    tx
                }
            }
        };

        // Leader path. Always clear the in-flight slot, success or not.
        let result = fetch().await;
        match &result {
            Ok(payload) => {
                self.set_auto_ttl(key.clone(), class, payload.clone()).await;
            }
            Err(err) => debug!(%key, %err, "leader fetch failed"),
        }
        self.inflight.remove(&flight_key);
        let broadcast_value: FlightResult = result.clone();
        // No receivers is fine; nobody joined this flight.
        let _ = sender.send(broadcast_value);
        result
    }
}
