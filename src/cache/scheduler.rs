use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::BatchConfig;
use crate::models::{DataRequest, DataType, ProviderId};

use super::BackgroundHandle;

/// Callback executing one flushed batch against one provider.
pub type BatchExecutor = Arc<
    dyn Fn(ProviderId, Vec<DataRequest>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug)]
struct PendingGroup {
    requests: Vec<DataRequest>,
    opened_at: DateTime<Utc>,
}

/// Groups pending refresh requests by (provider, data type) and flushes
/// a group when it hits the size threshold or its time window expires.
/// Deferrable data (fundamentals, news) additionally waits for a
/// configured low-load hour, up to a hard deadline, collapsing many
/// individual provider calls into fewer batched ones.
pub struct BatchScheduler {
    config: BatchConfig,
    clock: SharedClock,
    executor: BatchExecutor,
    groups: Mutex<HashMap<(ProviderId, DataType), PendingGroup>>,
}

/// Refreshes that can wait for off-peak execution without going stale
/// enough to matter.
fn is_deferrable(data_type: DataType) -> bool {
    matches!(data_type, DataType::Fundamentals | DataType::News)
}

impl BatchScheduler {
    pub fn new(config: BatchConfig, clock: SharedClock, executor: BatchExecutor) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            executor,
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// Queue one refresh. Flushes the group inline once it reaches the
    /// size threshold; otherwise the periodic loop picks it up.
    pub async fn enqueue(&self, provider: ProviderId, request: DataRequest) {
        let flush_now = {
            let mut groups = self.groups.lock().unwrap();
            let group = groups
                .entry((provider.clone(), request.data_type))
                .or_insert_with(|| PendingGroup {
                    requests: Vec::new(),
                    opened_at: self.clock.now(),
                });
            group.requests.push(request.clone());
            if group.requests.len() >= self.config.max_batch_size {
                groups.remove(&(provider.clone(), request.data_type))
            } else {
                None
            }
        };
        if let Some(group) = flush_now {
            debug!(provider = %provider, data_type = %request.data_type, size = group.requests.len(), "size-triggered batch flush");
            self.execute(provider, group.requests).await;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.groups
            .lock()
            .unwrap()
            .values()
            .map(|g| g.requests.len())
            .sum()
    }

    /// Pull every group whose flush condition holds at `now`.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<(ProviderId, Vec<DataRequest>)> {
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        // A deferred group may wait at most this long for a low-load hour.
        let hard_deadline = window * 12;
        let low_load = self.config.low_load_hours_utc.contains(&now.hour());

        let mut groups = self.groups.lock().unwrap();
        let due_keys: Vec<(ProviderId, DataType)> = groups
            .iter()
            .filter(|((_, data_type), group)| {
                let age = now - group.opened_at;
                if age < window {
                    return false;
                }
                if is_deferrable(*data_type) && !low_load && age < hard_deadline {
                    return false;
                }
                true
            })
            .map(|(key, _)| key.clone())
            .collect();

        due_keys
            .into_iter()
            .filter_map(|key| groups.remove(&key).map(|g| (key.0, g.requests)))
            .collect()
    }

    /// One scheduler pass; separated from the loop so tests can drive it.
    pub async fn run_once(&self) {
        let due = self.take_due(self.clock.now());
        for (provider, requests) in due {
            debug!(provider = %provider, size = requests.len(), "window-triggered batch flush");
            self.execute(provider, requests).await;
        }
    }

    async fn execute(&self, provider: ProviderId, mut requests: Vec<DataRequest>) {
        // Same request queued twice in one window is one upstream call.
        let mut seen = std::collections::HashSet::new();
        requests.retain(|r| seen.insert((r.asset.clone(), r.qualifier.clone())));
        (self.executor)(provider, requests).await;
    }

    /// Spawn the periodic flush loop.
    pub fn start(self: Arc<Self>) -> BackgroundHandle {
        let (tx, mut rx) = watch::channel(false);
        let tick = self.config.window / 2;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick.max(std::time::Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_once().await,
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            info!("batch scheduler stopped");
                            break;
                        }
                    }
                }
            }
        });
        BackgroundHandle::new("batch-scheduler", tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeZone;

    use crate::clock::ManualClock;
    use crate::models::Asset;

    struct Captured {
        batches: Mutex<Vec<(ProviderId, usize)>>,
        flushes: AtomicUsize,
    }

    fn scheduler(
        config: BatchConfig,
    ) -> (Arc<ManualClock>, Arc<Captured>, Arc<BatchScheduler>) {
        let clock = ManualClock::starting_now();
        let captured = Arc::new(Captured {
            batches: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
        });
        let captured2 = captured.clone();
        let executor: BatchExecutor = Arc::new(move |provider, requests| {
            let captured = captured2.clone();
            Box::pin(async move {
                captured
                    .batches
                    .lock()
                    .unwrap()
                    .push((provider, requests.len()));
                captured.flushes.fetch_add(1, Ordering::SeqCst);
            })
        });
        let sched = BatchScheduler::new(config, clock.clone(), executor);
        (clock, captured, sched)
    }

    fn price_request(symbol: &str) -> DataRequest {
        DataRequest::new(Asset::equity(symbol), DataType::Price)
    }

    #[tokio::test]
    async fn test_size_threshold_flushes_immediately() {
        let (_clock, captured, sched) = scheduler(BatchConfig {
            max_batch_size: 3,
            ..BatchConfig::default()
        });
        sched.enqueue("alpha".into(), price_request("A")).await;
        sched.enqueue("alpha".into(), price_request("B")).await;
        assert_eq!(captured.flushes.load(Ordering::SeqCst), 0);
        sched.enqueue("alpha".into(), price_request("C")).await;
        assert_eq!(captured.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(captured.batches.lock().unwrap()[0], ("alpha".into(), 3));
        assert_eq!(sched.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_window_expiry_flushes() {
        let (clock, captured, sched) = scheduler(BatchConfig {
            window: Duration::from_secs(5),
            max_batch_size: 100,
            ..BatchConfig::default()
        });
        sched.enqueue("alpha".into(), price_request("A")).await;
        sched.run_once().await;
        assert_eq!(captured.flushes.load(Ordering::SeqCst), 0, "window not elapsed");

        clock.advance(Duration::from_secs(6));
        sched.run_once().await;
        assert_eq!(captured.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_groups_split_by_provider_and_type() {
        let (clock, captured, sched) = scheduler(BatchConfig {
            window: Duration::from_secs(5),
            max_batch_size: 100,
            ..BatchConfig::default()
        });
        sched.enqueue("alpha".into(), price_request("A")).await;
        sched.enqueue("beta".into(), price_request("B")).await;
        clock.advance(Duration::from_secs(6));
        sched.run_once().await;
        assert_eq!(captured.flushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deferrable_waits_for_low_load_hour() {
        let low_hour = 3u32;
        // Pin the clock to an hour that is definitely not low-load.
        let busy = chrono::Utc
            .with_ymd_and_hms(2024, 1, 10, 15, 0, 0)
            .unwrap();
        let clock = ManualClock::new(busy);
        let captured = Arc::new(Captured {
            batches: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
        });
        let captured2 = captured.clone();
        let executor: BatchExecutor = Arc::new(move |provider, requests| {
            let captured = captured2.clone();
            Box::pin(async move {
                captured
                    .batches
                    .lock()
                    .unwrap()
                    .push((provider, requests.len()));
                captured.flushes.fetch_add(1, Ordering::SeqCst);
            })
        });
        let sched = BatchScheduler::new(
            BatchConfig {
                window: Duration::from_secs(5),
                max_batch_size: 100,
                low_load_hours_utc: vec![low_hour],
            },
            clock.clone(),
            executor,
        );

        let req = DataRequest::new(Asset::equity("A"), DataType::Fundamentals);
        sched.enqueue("alpha".into(), req).await;
        clock.advance(Duration::from_secs(6));
        sched.run_once().await;
        assert_eq!(
            captured.flushes.load(Ordering::SeqCst),
            0,
            "deferrable batch held outside low-load hours"
        );

        // Advance to 03:00 the next day.
        clock.advance(Duration::from_secs(12 * 3600));
        sched.run_once().await;
        assert_eq!(captured.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_requests_collapse() {
        let (clock, captured, sched) = scheduler(BatchConfig {
            window: Duration::from_secs(5),
            max_batch_size: 100,
            ..BatchConfig::default()
        });
        sched.enqueue("alpha".into(), price_request("A")).await;
        sched.enqueue("alpha".into(), price_request("A")).await;
        clock.advance(Duration::from_secs(6));
        sched.run_once().await;
        assert_eq!(captured.batches.lock().unwrap()[0].1, 1);
    }
}
