use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::models::{
    ArbitrationPlan, DataRequest, MergeStrategy, ProviderResponse, ProviderScore, ScoreComponents,
};
use crate::provider::ProviderRegistry;

use super::merge;
use super::stats::ScoreTracker;

/// Scores candidates, builds per-request plans and executes them with
/// sequential fallback. One instance shared across all queries.
pub struct ArbitrationEngine {
    registry: ProviderRegistry,
    tracker: Arc<ScoreTracker>,
    config: Arc<EngineConfig>,
}

impl ArbitrationEngine {
    pub fn new(registry: ProviderRegistry, tracker: Arc<ScoreTracker>, config: Arc<EngineConfig>) -> Self {
        Self {
            registry,
            tracker,
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<ScoreTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Score every candidate that declares support for the request.
    ///
    /// Filters: providers whose observed freshness already exceeds
    /// `max_staleness` (their data would arrive stale) and providers
    /// currently rate limited. Providers with no observation history are
    /// kept with neutral component scores so new sources get tried.
    /// Result is sorted by descending total, provider id as tiebreak, so
    /// identical inputs always produce identical orderings.
    pub fn score(&self, request: &DataRequest) -> Vec<ProviderScore> {
        let weights = &self.config.scoring;
        let max_staleness = request.requirements.max_staleness;
        let mut scores: Vec<ProviderScore> = Vec::new();

        for provider in self.registry.candidates_for(&request.asset, request.data_type) {
            let id = provider.id().to_string();
            if self.tracker.is_rate_limited(&id) {
                debug!(provider = %id, "skipping rate-limited provider");
                continue;
            }

            let observed = self.tracker.snapshot(&id);
            let health = provider.health();

            let freshness_score = if observed.freshness == Duration::MAX {
                0.5 // never observed: neutral
            } else if observed.freshness > max_staleness {
                debug!(provider = %id, freshness = ?observed.freshness, "skipping stale provider");
                continue;
            } else {
                1.0 - observed.freshness.as_secs_f64() / max_staleness.as_secs_f64()
            };

            let mut latency_score = if observed.latency_p95.is_zero() {
                1.0
            } else {
                (1.0 - observed.latency_p95.as_secs_f64()
                    / self.config.attempt_timeout.as_secs_f64())
                .clamp(0.0, 1.0)
            };
            // Regional preference: a cross-region hop eats into the
            // latency component even when observed p95 looks fine.
            if let (Some(want), Some(have)) = (request.requirements.region, provider.region()) {
                if want != have {
                    latency_score *= 0.8;
                }
            }

            let components = ScoreComponents {
                freshness: freshness_score * weights.freshness * 100.0,
                latency: latency_score * weights.latency * 100.0,
                uptime: health.uptime_24h.clamp(0.0, 1.0) * weights.uptime * 100.0,
                completeness: health.completeness.clamp(0.0, 1.0) * weights.completeness * 100.0,
                reliability: observed.reliability * weights.reliability * 100.0,
            };
            let total = components.freshness
                + components.latency
                + components.uptime
                + components.completeness
                + components.reliability;

            scores.push(ProviderScore {
                provider_id: id,
                total,
                components,
            });
        }

        scores.sort_by(|a, b| {
            b.total
                .partial_cmp(&a.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });
        scores
    }

    /// Primary = top score, fallbacks = next two, merge strategy by data
    /// type. Deterministic for identical scores.
    pub fn plan(&self, scores: &[ProviderScore], request: &DataRequest) -> Result<ArbitrationPlan, EngineError> {
        let primary = scores.first().ok_or_else(|| EngineError::NoProviderAvailable {
            attempts: 0,
            data_type: request.data_type.to_string(),
        })?;
        let fallbacks = scores
            .iter()
            .skip(1)
            .take(2)
            .map(|s| s.provider_id.clone())
            .collect();
        let estimated_latency = self.tracker.snapshot(&primary.provider_id).latency_p95;
        Ok(ArbitrationPlan {
            primary: primary.provider_id.clone(),
            fallbacks,
            merge_strategy: MergeStrategy::for_data_type(request.data_type),
            estimated_latency,
        })
    }

    /// Try primary then each fallback in order, each under the per-attempt
    /// timeout. Sequential on purpose: preserves provider priority and
    /// avoids wasted upstream calls. Individual failures are recorded and
    /// absorbed; only total exhaustion escalates.
    pub async fn execute_with_fallback(
        &self,
        plan: &ArbitrationPlan,
        request: &DataRequest,
    ) -> Result<ProviderResponse, EngineError> {
        let mut attempts = 0usize;
        for id in plan.attempt_order() {
            let Some(provider) = self.registry.get(id) else {
                warn!(provider = %id, "planned provider missing from registry");
                continue;
            };
            attempts += 1;
            let started = Instant::now();
            match timeout(self.config.attempt_timeout, provider.fetch(request)).await {
                Ok(Ok(response)) => {
                    let latency = started.elapsed();
                    self.tracker
                        .record_success(id, latency, response.source_timestamp);
                    let health = provider.health();
                    self.tracker
                        .record_health(id, health.uptime_24h, health.completeness);
                    debug!(provider = %id, ?latency, attempts, "fetch succeeded");
                    return Ok(response);
                }
                Ok(Err(EngineError::ProviderRateLimit { retry_after, .. })) => {
                    warn!(provider = %id, ?retry_after, "provider rate limited, falling back");
                    self.tracker.record_rate_limit(id, retry_after);
                }
                Ok(Err(err)) => {
                    warn!(provider = %id, %err, "provider failed, falling back");
                    self.tracker.record_failure(id);
                }
                Err(_) => {
                    warn!(provider = %id, timeout = ?self.config.attempt_timeout, "attempt timed out, falling back");
                    self.tracker.record_failure(id);
                }
            }
        }
        Err(EngineError::NoProviderAvailable {
            attempts,
            data_type: request.data_type.to_string(),
        })
    }

    /// Full path for one request: score, plan, execute with fallback.
    pub async fn resolve(&self, request: &DataRequest) -> Result<ProviderResponse, EngineError> {
        let scores = self.score(request);
        let plan = self.plan(&scores, request)?;
        info!(
            primary = %plan.primary,
            fallbacks = plan.fallbacks.len(),
            data_type = %request.data_type,
            asset = %request.asset,
            "arbitration plan ready"
        );
        self.execute_with_fallback(&plan, request).await
    }

    /// Fan out to the top `k` scored providers concurrently and merge
    /// their answers under the data type's strategy. Used when a single
    /// best answer is not enough (composite bars, sentiment consensus).
    pub async fn resolve_merged(
        &self,
        request: &DataRequest,
        k: usize,
    ) -> Result<ProviderResponse, EngineError> {
        let scores = self.score(request);
        if scores.is_empty() {
            return Err(EngineError::NoProviderAvailable {
                attempts: 0,
                data_type: request.data_type.to_string(),
            });
        }

        let mut set: JoinSet<(String, Result<ProviderResponse, EngineError>, Duration)> =
            JoinSet::new();
        let attempt_timeout = self.config.attempt_timeout;
        for score in scores.iter().take(k.max(1)) {
            let Some(provider) = self.registry.get(&score.provider_id) else {
                continue;
            };
            let provider = provider.clone();
            let req = request.clone();
            set.spawn(async move {
                let started = Instant::now();
                let result = match timeout(attempt_timeout, provider.fetch(&req)).await {
                    Ok(r) => r,
                    Err(_) => Err(EngineError::ProviderTimeout {
                        provider: provider.id().to_string(),
                        timeout: attempt_timeout,
                    }),
                };
                (provider.id().to_string(), result, started.elapsed())
            });
        }

        let mut responses = Vec::new();
        let mut attempts = 0usize;
        while let Some(joined) = set.join_next().await {
            let Ok((id, result, latency)) = joined else {
                continue;
            };
            attempts += 1;
            match result {
                Ok(response) => {
                    self.tracker
                        .record_success(&id, latency, response.source_timestamp);
                    responses.push(response);
                }
                Err(EngineError::ProviderRateLimit { retry_after, .. }) => {
                    self.tracker.record_rate_limit(&id, retry_after);
                }
                Err(err) => {
                    warn!(provider = %id, %err, "merged fetch arm failed");
                    self.tracker.record_failure(&id);
                }
            }
        }

        if responses.is_empty() {
            return Err(EngineError::NoProviderAvailable {
                attempts,
                data_type: request.data_type.to_string(),
            });
        }
        merge::merge(responses, MergeStrategy::for_data_type(request.data_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::clock::ManualClock;
    use crate::models::{Asset, DataType, Payload, ProviderStats};
    use crate::provider::Provider;

    /// Scripted provider: fails the first `fail_first` calls, then succeeds.
    struct ScriptedProvider {
        id: String,
        fail_first: usize,
        calls: AtomicUsize,
        price: f64,
        uptime: f64,
    }

    impl ScriptedProvider {
        fn new(id: &str, fail_first: usize, price: f64) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail_first,
                calls: AtomicUsize::new(0),
                price,
                uptime: 1.0,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn supports(&self, _asset: &Asset, _data_type: DataType) -> bool {
            true
        }

        async fn fetch(&self, _request: &DataRequest) -> Result<ProviderResponse, EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(EngineError::Provider {
                    provider: self.id.clone(),
                    message: "scripted failure".into(),
                });
            }
            Ok(ProviderResponse {
                provider_id: self.id.clone(),
                payload: Payload::Price { value: self.price },
                source_timestamp: Utc::now(),
                confidence: 0.95,
            })
        }

        fn health(&self) -> ProviderStats {
            ProviderStats {
                provider_id: self.id.clone(),
                freshness: Duration::from_secs(1),
                latency_p95: Duration::from_millis(50),
                uptime_24h: self.uptime,
                completeness: 1.0,
                reliability: 1.0,
                rate_limited_until: None,
            }
        }
    }

    fn engine_with(providers: Vec<Arc<ScriptedProvider>>) -> ArbitrationEngine {
        let clock = ManualClock::starting_now();
        let tracker = Arc::new(ScoreTracker::new(clock));
        let registry = ProviderRegistry::new(
            providers
                .into_iter()
                .map(|p| p as crate::provider::SharedProvider)
                .collect(),
        );
        ArbitrationEngine::new(registry, tracker, Arc::new(EngineConfig::default()))
    }

    fn price_request() -> DataRequest {
        DataRequest::new(Asset::equity("TSLA"), DataType::Price)
    }

    #[test]
    fn test_score_totals_in_range() {
        let engine = engine_with(vec![
            ScriptedProvider::new("alpha", 0, 100.0),
            ScriptedProvider::new("beta", 0, 100.0),
        ]);
        for score in engine.score(&price_request()) {
            assert!(score.total >= 0.0 && score.total <= 100.0, "total {}", score.total);
        }
    }

    #[test]
    fn test_plan_is_deterministic() {
        let engine = engine_with(vec![
            ScriptedProvider::new("alpha", 0, 100.0),
            ScriptedProvider::new("beta", 0, 100.0),
            ScriptedProvider::new("gamma", 0, 100.0),
            ScriptedProvider::new("delta", 0, 100.0),
        ]);
        let request = price_request();
        let p1 = engine.plan(&engine.score(&request), &request).unwrap();
        let p2 = engine.plan(&engine.score(&request), &request).unwrap();
        assert_eq!(p1.primary, p2.primary);
        assert_eq!(p1.fallbacks, p2.fallbacks);
        assert_eq!(p1.fallbacks.len(), 2, "fallbacks capped at two");
    }

    #[tokio::test]
    async fn test_fallback_makes_exactly_n_plus_one_attempts() {
        // Equal stats: deterministic id order alpha, beta, gamma.
        let alpha = ScriptedProvider::new("alpha", usize::MAX, 0.0);
        let beta = ScriptedProvider::new("beta", usize::MAX, 0.0);
        let gamma = ScriptedProvider::new("gamma", 0, 123.0);
        let engine = engine_with(vec![alpha.clone(), beta.clone(), gamma.clone()]);

        let request = price_request();
        let response = engine.resolve(&request).await.unwrap();
        assert_eq!(response.provider_id, "gamma");
        assert_eq!(alpha.calls(), 1);
        assert_eq!(beta.calls(), 1);
        assert_eq!(gamma.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_terminal() {
        let engine = engine_with(vec![
            ScriptedProvider::new("alpha", usize::MAX, 0.0),
            ScriptedProvider::new("beta", usize::MAX, 0.0),
        ]);
        let err = engine.resolve(&price_request()).await.unwrap_err();
        match err {
            EngineError::NoProviderAvailable { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected NoProviderAvailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failures_update_reliability() {
        let alpha = ScriptedProvider::new("alpha", usize::MAX, 0.0);
        let beta = ScriptedProvider::new("beta", 0, 50.0);
        let engine = engine_with(vec![alpha, beta]);
        let request = price_request();
        engine.resolve(&request).await.unwrap();

        let alpha_stats = engine.tracker().snapshot("alpha");
        let beta_stats = engine.tracker().snapshot("beta");
        assert!(alpha_stats.reliability < 1.0);
        assert!((beta_stats.reliability - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_rate_limited_provider_dropped_from_scoring() {
        let alpha = ScriptedProvider::new("alpha", 0, 1.0);
        let beta = ScriptedProvider::new("beta", 0, 2.0);
        let engine = engine_with(vec![alpha, beta]);
        engine
            .tracker()
            .record_rate_limit("alpha", Some(Duration::from_secs(300)));

        let scores = engine.score(&price_request());
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].provider_id, "beta");
    }

    /// Provider that waits on a (shared) gate before answering; the gate
    /// never opens, so every attempt runs into the per-attempt timeout.
    struct HangingProvider {
        id: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Provider for HangingProvider {
        fn id(&self) -> &str {
            &self.id
        }
        fn supports(&self, _asset: &Asset, _data_type: DataType) -> bool {
            true
        }
        async fn fetch(&self, _request: &DataRequest) -> Result<ProviderResponse, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
        fn health(&self) -> ProviderStats {
            ProviderStats {
                provider_id: self.id.clone(),
                freshness: Duration::from_secs(1),
                latency_p95: Duration::from_millis(10),
                uptime_24h: 1.0,
                completeness: 1.0,
                reliability: 1.0,
                rate_limited_until: None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout_moves_to_fallback() {
        let hanging = Arc::new(HangingProvider {
            id: "alpha".into(),
            calls: AtomicUsize::new(0),
        });
        let good = ScriptedProvider::new("beta", 0, 77.0);

        let clock = ManualClock::starting_now();
        let tracker = Arc::new(ScoreTracker::new(clock));
        let registry = ProviderRegistry::new(vec![hanging.clone(), good.clone()]);
        let engine = ArbitrationEngine::new(registry, tracker, Arc::new(EngineConfig::default()));

        // Paused tokio time auto-advances through the timeout.
        let response = engine.resolve(&price_request()).await.unwrap();
        assert_eq!(response.provider_id, "beta");
        assert_eq!(hanging.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_merged_combines_sources() {
        let providers: Vec<Arc<ScriptedProvider>> = vec![
            ScriptedProvider::new("alpha", 0, 100.0),
            ScriptedProvider::new("beta", 0, 101.0),
        ];
        let engine = engine_with(providers);
        let response = engine.resolve_merged(&price_request(), 2).await.unwrap();
        // LatestWins for price: one of the two answers, merged id not used.
        match response.payload {
            Payload::Price { value } => assert!(value == 100.0 || value == 101.0),
            other => panic!("expected price, got {other:?}"),
        }
    }
}
