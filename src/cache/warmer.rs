use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::WarmerConfig;

use super::{BackgroundHandle, CacheKey};

/// Callback the warmer uses to refresh one key. The cache layer stays
/// ignorant of how a refresh is actually satisfied (arbitration, batch
/// scheduler, ...).
pub type Refresher =
    Arc<dyn Fn(CacheKey) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Default, Clone)]
struct KeyPattern {
    count: u64,
    /// Access histogram by UTC hour of day.
    by_hour: [u64; 24],
}

/// Per-key request frequency and time-of-day pattern, fed by every cache
/// read. Drives warming priority.
pub struct AccessPatterns {
    config: WarmerConfig,
    patterns: DashMap<CacheKey, KeyPattern>,
    /// Known event windows (earnings dates etc.) per symbol: keys for
    /// these symbols get a flat priority boost while inside the window.
    event_windows: DashMap<String, (DateTime<Utc>, DateTime<Utc>)>,
}

impl AccessPatterns {
    pub fn new(config: WarmerConfig) -> Self {
        Self {
            config,
            patterns: DashMap::new(),
            event_windows: DashMap::new(),
        }
    }

    pub fn record_access(&self, key: &CacheKey, now: DateTime<Utc>) {
        let mut pattern = self.patterns.entry(key.clone()).or_default();
        pattern.count += 1;
        pattern.by_hour[now.hour() as usize] += 1;
    }

    /// Register a window (e.g. an earnings date) during which the symbol's
    /// keys should be warmed ahead of expected demand.
    pub fn register_event_window(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.event_windows
            .insert(symbol.to_uppercase(), (start, end));
    }

    /// Warming priority: request frequency scaled by how much of that
    /// traffic historically lands in the current hour, plus the event
    /// boost. A documented default formula, not a derived constant.
    pub fn priority(&self, key: &CacheKey, now: DateTime<Utc>) -> f64 {
        let Some(pattern) = self.patterns.get(key) else {
            return 0.0;
        };
        let hour_share = pattern.by_hour[now.hour() as usize] as f64 / pattern.count.max(1) as f64;
        let mut priority = pattern.count as f64 * (0.5 + hour_share);
        if let Some(window) = self.event_windows.get(&key.symbol) {
            let (start, end) = *window;
            if now >= start && now <= end {
                priority += self.config.event_boost;
            }
        }
        priority
    }

    /// Keys worth warming right now, highest priority first.
    pub fn top_candidates(&self, now: DateTime<Utc>, k: usize) -> Vec<CacheKey> {
        let mut scored: Vec<(CacheKey, f64)> = self
            .patterns
            .iter()
            .filter(|kv| kv.value().count >= self.config.min_frequency)
            .map(|kv| {
                let key = kv.key().clone();
                let p = self.priority(&key, now);
                (key, p)
            })
            .collect();
        scored.sort_by(|(ka, pa), (kb, pb)| {
            pb.partial_cmp(pa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ka.to_string().cmp(&kb.to_string()))
        });
        scored.into_iter().take(k).map(|(key, _)| key).collect()
    }
}

/// Background loop proactively refreshing the hottest keys before their
/// expected demand, cutting cold-miss latency for popular symbols.
pub struct PredictiveWarmer {
    patterns: Arc<AccessPatterns>,
    refresher: Refresher,
    config: WarmerConfig,
    clock: SharedClock,
}

impl PredictiveWarmer {
    pub fn new(
        patterns: Arc<AccessPatterns>,
        refresher: Refresher,
        config: WarmerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            patterns,
            refresher,
            config,
            clock,
        }
    }

    /// One warming pass. Separated from the loop so tests can drive it.
    pub async fn run_once(&self) {
        let now = self.clock.now();
        let candidates = self.patterns.top_candidates(now, self.config.top_k);
        if candidates.is_empty() {
            return;
        }
        debug!(count = candidates.len(), "warming high-priority keys");
        for key in candidates {
            (self.refresher)(key).await;
        }
    }

    /// Spawn the periodic loop. The jittered start spreads warmers out
    /// when several engines boot at once.
    pub fn start(self) -> BackgroundHandle {
        let (tx, mut rx) = watch::channel(false);
        let interval = self.config.interval;
        let handle = tokio::spawn(async move {
            let jitter = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64 / 4 + 1);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(jitter)) => {}
                _ = rx.changed() => {
                    if *rx.borrow() {
                        return;
                    }
                }
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_once().await,
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            info!("predictive warmer stopped");
                            break;
                        }
                    }
                }
            }
        });
        BackgroundHandle::new("predictive-warmer", tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::clock::{Clock, ManualClock};
    use crate::models::DataType;

    fn patterns() -> AccessPatterns {
        AccessPatterns::new(WarmerConfig {
            min_frequency: 2,
            ..WarmerConfig::default()
        })
    }

    fn key(symbol: &str) -> CacheKey {
        CacheKey::new(symbol, DataType::Price, None)
    }

    #[test]
    fn test_priority_orders_by_frequency() {
        let p = patterns();
        let now = Utc::now();
        for _ in 0..10 {
            p.record_access(&key("TSLA"), now);
        }
        for _ in 0..2 {
            p.record_access(&key("XYZ"), now);
        }
        let top = p.top_candidates(now, 10);
        assert_eq!(top.first(), Some(&key("TSLA")));
    }

    #[test]
    fn test_min_frequency_gate() {
        let p = patterns();
        let now = Utc::now();
        p.record_access(&key("ONE"), now);
        assert!(p.top_candidates(now, 10).is_empty());
    }

    #[test]
    fn test_event_window_boost() {
        let p = patterns();
        let now = Utc::now();
        for _ in 0..3 {
            p.record_access(&key("QUIET"), now);
            p.record_access(&key("EARN"), now);
        }
        p.register_event_window("EARN", now - chrono::Duration::hours(1), now + chrono::Duration::hours(1));
        assert!(p.priority(&key("EARN"), now) > p.priority(&key("QUIET"), now));

        // Outside the window the boost disappears.
        let later = now + chrono::Duration::hours(2);
        let boosted = p.priority(&key("EARN"), later);
        let quiet = p.priority(&key("QUIET"), later);
        assert!((boosted - quiet).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_run_once_refreshes_top_keys() {
        let clock = ManualClock::starting_now();
        let p = Arc::new(patterns());
        let now = clock.now();
        for _ in 0..5 {
            p.record_access(&key("TSLA"), now);
        }
        let refreshed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let refreshed2 = refreshed.clone();
        let calls2 = calls.clone();
        let refresher: Refresher = Arc::new(move |key: CacheKey| {
            let refreshed = refreshed2.clone();
            let calls = calls2.clone();
            Box::pin(async move {
                refreshed.lock().unwrap().push(key.to_string());
                calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let warmer = PredictiveWarmer::new(p, refresher, WarmerConfig::default(), clock);
        warmer.run_once().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(refreshed.lock().unwrap()[0], "TSLA:price");
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let clock = ManualClock::starting_now();
        let p = Arc::new(patterns());
        let refresher: Refresher = Arc::new(|_| Box::pin(async {}));
        let warmer = PredictiveWarmer::new(p, refresher, WarmerConfig::default(), clock);
        let handle = warmer.start();
        handle.stop().await;
    }
}
