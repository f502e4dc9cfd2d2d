//! Multi-provider market data engine: scores and arbitrates between
//! data providers, caches results across two tiers, and executes a
//! small query language as dependency-ordered task DAGs.

pub mod arbitration;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dsl;
pub mod errors;
pub mod models;
pub mod provider;
pub mod query;

use std::sync::Arc;

use tracing::warn;
use tracing_subscriber::EnvFilter;

use arbitration::{ArbitrationEngine, ScoreTracker};
use cache::scheduler::BatchExecutor;
use cache::warmer::Refresher;
use cache::{
    AccessPatterns, BackgroundHandle, BatchScheduler, CacheAnalytics, CacheKey, CacheTier,
    EvictionPolicy, MemoryBackend, PredictiveWarmer, ProtectedKeys, TtlCalculator,
};
use clock::{system_clock, SharedClock};
use config::EngineConfig;
use errors::EngineError;
use models::DataRequest;
use provider::{ProviderRegistry, SharedProvider};
use query::{QueryExecutor, QueryService};

/// Initialize tracing with `RUST_LOG`-style filtering, defaulting to
/// `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Fully wired engine: arbitration, two-tier cache and the async query
/// service, sharing one clock and one config.
pub struct Engine {
    pub arbitration: Arc<ArbitrationEngine>,
    pub cache: Arc<CacheTier>,
    pub queries: Arc<QueryService>,
    config: Arc<EngineConfig>,
    clock: SharedClock,
}

impl Engine {
    pub fn new(config: EngineConfig, providers: Vec<SharedProvider>) -> Result<Self, EngineError> {
        Self::with_clock(config, providers, system_clock())
    }

    /// Build with an injected clock. Tests pass a manual clock to drive
    /// TTLs and scheduling deterministically.
    pub fn with_clock(
        config: EngineConfig,
        providers: Vec<SharedProvider>,
        clock: SharedClock,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);

        let tracker = Arc::new(ScoreTracker::new(clock.clone()));
        let registry = ProviderRegistry::new(providers);
        let arbitration = Arc::new(ArbitrationEngine::new(registry, tracker, config.clone()));

        let policy = EvictionPolicy::new(config.cache.policy, config.cache.hybrid_recency_weight);
        let protected = ProtectedKeys::from_patterns(&config.cache.protected_patterns);
        let cache = CacheTier::new(
            MemoryBackend::new(
                config.cache.l1_capacity,
                policy,
                protected.clone(),
                clock.clone(),
            ),
            MemoryBackend::new(config.cache.l2_capacity, policy, protected, clock.clone()),
            TtlCalculator::new(config.ttl.clone()),
            Arc::new(CacheAnalytics::new()),
            Arc::new(AccessPatterns::new(config.warmer.clone())),
            clock.clone(),
        );

        let executor = QueryExecutor::new(arbitration.clone(), cache.clone());
        let queries = QueryService::new(executor);

        Ok(Self {
            arbitration,
            cache,
            queries,
            config,
            clock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the predictive warming loop. The returned handle stops it.
    pub fn start_warmer(&self) -> BackgroundHandle {
        let arbitration = self.arbitration.clone();
        let cache = self.cache.clone();
        let refresher: Refresher = Arc::new(move |key: CacheKey| {
            let arbitration = arbitration.clone();
            let cache = cache.clone();
            Box::pin(async move { refresh_key(arbitration, cache, key).await })
        });
        PredictiveWarmer::new(
            self.cache.patterns().clone(),
            refresher,
            self.config.warmer.clone(),
            self.clock.clone(),
        )
        .start()
    }

    /// Spawn the batch refresh scheduler. Enqueue refreshes on the
    /// returned scheduler; the handle stops the flush loop.
    pub fn start_scheduler(&self) -> (Arc<BatchScheduler>, BackgroundHandle) {
        let arbitration = self.arbitration.clone();
        let cache = self.cache.clone();
        let executor: BatchExecutor = Arc::new(move |provider_id, requests| {
            let arbitration = arbitration.clone();
            let cache = cache.clone();
            Box::pin(async move {
                let Some(provider) = arbitration.registry().get(&provider_id).cloned() else {
                    warn!(provider = %provider_id, "batch target no longer registered");
                    return;
                };
                for request in requests {
                    match provider.fetch(&request).await {
                        Ok(response) => {
                            let key = CacheKey::for_request(
                                &request.asset,
                                request.data_type,
                                request.qualifier.as_deref(),
                            );
                            cache
                                .set_auto_ttl(key, request.asset.class, response.payload)
                                .await;
                        }
                        Err(err) => {
                            warn!(provider = %provider_id, %err, "batched refresh failed")
                        }
                    }
                }
            })
        });
        let scheduler =
            BatchScheduler::new(self.config.batch.clone(), self.clock.clone(), executor);
        let handle = scheduler.clone().start();
        (scheduler, handle)
    }
}

/// Re-fetch one cache key through arbitration and write it back with a
/// fresh TTL. Failures only log; warming is best effort.
async fn refresh_key(
    arbitration: Arc<ArbitrationEngine>,
    cache: Arc<CacheTier>,
    key: CacheKey,
) {
    let asset = query::planner::asset_for(&key.symbol);
    let mut request = DataRequest::new(asset.clone(), key.data_type);
    if let Some(qualifier) = &key.qualifier {
        request = request.with_qualifier(qualifier);
    }
    match arbitration.resolve(&request).await {
        Ok(response) => cache.set_auto_ttl(key, asset.class, response.payload).await,
        Err(err) => warn!(%key, %err, "warm refresh failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_builds_with_defaults() {
        let engine = Engine::new(EngineConfig::default(), Vec::new()).unwrap();
        assert_eq!(engine.config().cache.l1_capacity, 10_000);
    }

    #[test]
    fn test_engine_rejects_bad_weights() {
        let mut config = EngineConfig::default();
        config.scoring.freshness = 0.9;
        let err = Engine::new(config, Vec::new()).err().unwrap();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_background_lifecycles_stop_cleanly() {
        let engine = Engine::new(EngineConfig::default(), Vec::new()).unwrap();
        let warmer = engine.start_warmer();
        let (_scheduler, scheduler_handle) = engine.start_scheduler();
        warmer.stop().await;
        scheduler_handle.stop().await;
    }
}
