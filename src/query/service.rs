use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{error, info};
use uuid::Uuid;

use crate::dsl;
use crate::errors::{EngineError, ErrorResponse};
use crate::models::{Task, TaskStatus};

use super::executor::{QueryExecutor, StepOutcome};
use super::planner;

/// Async query front door. `submit` compiles and plans synchronously so
/// the caller gets parse errors immediately, then runs the plan in the
/// background; `status` returns point-in-time task snapshots with
/// partial results while execution is still in flight.
pub struct QueryService {
    executor: Arc<QueryExecutor>,
    tasks: Arc<DashMap<Uuid, Task>>,
}

impl QueryService {
    pub fn new(executor: Arc<QueryExecutor>) -> Arc<Self> {
        Arc::new(Self {
            executor,
            tasks: Arc::new(DashMap::new()),
        })
    }

    /// Compile, plan and start executing a query. Returns the task id on
    /// success; compile and plan errors surface here, execution errors
    /// surface on the task.
    pub fn submit(&self, query: &str) -> Result<Uuid, EngineError> {
        let statement = dsl::compile(query)?;
        let plan = planner::plan(&statement)?;

        let mut task = Task::new(query);
        task.status = TaskStatus::Running;
        let id = task.id;
        let total = plan.steps.len();
        self.tasks.insert(id, task);
        info!(task = %id, steps = total, "query submitted");

        let executor = self.executor.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            // Progress is completed steps over total; failed steps do not
            // advance it.
            let mut completed = 0usize;
            let result = executor
                .execute(&plan, |step_id, outcome| {
                    if let StepOutcome::Completed(_) = outcome {
                        completed += 1;
                    }
                    if let Some(mut entry) = tasks.get_mut(&id) {
                        if let StepOutcome::Completed(value) = outcome {
                            entry
                                .partial_results
                                .insert(step_id.to_string(), value.clone());
                        }
                        entry.progress = completed as f64 / total as f64;
                    }
                })
                .await;

            let Some(mut entry) = tasks.get_mut(&id) else {
                return;
            };
            match result {
                Ok(value) => {
                    entry.status = TaskStatus::Completed;
                    entry.progress = 1.0;
                    entry.result = Some(value);
                    info!(task = %id, "query completed");
                }
                Err(err) => {
                    entry.status = TaskStatus::Failed;
                    entry.error = Some(ErrorResponse::from(&err));
                    error!(task = %id, %err, "query failed");
                }
            }
        });

        Ok(id)
    }

    /// Snapshot of a task's current state, partial results included.
    pub fn status(&self, id: &Uuid) -> Result<Task, EngineError> {
        self.tasks
            .get(id)
            .map(|t| t.clone())
            .ok_or(EngineError::TaskNotFound(*id))
    }

    /// Poll until the task reaches a terminal state or the deadline
    /// passes. Returns the last snapshot either way.
    pub async fn wait(&self, id: &Uuid, deadline: Duration) -> Result<Task, EngineError> {
        let started = tokio::time::Instant::now();
        loop {
            let task = self.status(id)?;
            if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed)
                || started.elapsed() >= deadline
            {
                return Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::arbitration::{ArbitrationEngine, ScoreTracker};
    use crate::cache::{
        AccessPatterns, CacheAnalytics, CacheTier, EvictionPolicy, MemoryBackend, ProtectedKeys,
        TtlCalculator,
    };
    use crate::clock::system_clock;
    use crate::config::{EngineConfig, EvictionPolicyKind, TtlConfig, WarmerConfig};
    use crate::models::{
        Asset, DataRequest, DataType, Payload, ProviderResponse, ProviderStats,
    };
    use crate::provider::{Provider, ProviderRegistry};

    struct StubProvider;

    #[async_trait]
    impl Provider for StubProvider {
        fn id(&self) -> &str {
            "stub"
        }

        fn supports(&self, _asset: &Asset, _data_type: DataType) -> bool {
            true
        }

        async fn fetch(&self, request: &DataRequest) -> Result<ProviderResponse, EngineError> {
            if request.asset.symbol.starts_with("BAD") {
                return Err(EngineError::Provider {
                    provider: "stub".into(),
                    message: "down".into(),
                });
            }
            let payload = match request.data_type {
                DataType::History => Payload::Series {
                    points: (0..40)
                        .map(|i| {
                            (
                                Utc::now() - chrono::Duration::days(40 - i),
                                100.0 + i as f64,
                            )
                        })
                        .collect(),
                },
                _ => Payload::Price { value: 42.0 },
            };
            Ok(ProviderResponse {
                provider_id: "stub".into(),
                payload,
                source_timestamp: Utc::now(),
                confidence: 1.0,
            })
        }

        fn health(&self) -> ProviderStats {
            ProviderStats {
                provider_id: "stub".into(),
                freshness: Duration::from_secs(1),
                latency_p95: Duration::from_millis(10),
                uptime_24h: 1.0,
                completeness: 1.0,
                reliability: 1.0,
                rate_limited_until: None,
            }
        }
    }

    fn service() -> Arc<QueryService> {
        let clock = system_clock();
        let tracker = Arc::new(ScoreTracker::new(clock.clone()));
        let registry = ProviderRegistry::new(vec![Arc::new(StubProvider)]);
        let arbitration = Arc::new(ArbitrationEngine::new(
            registry,
            tracker,
            Arc::new(EngineConfig::default()),
        ));
        let policy = || EvictionPolicy::new(EvictionPolicyKind::Lru, 0.5);
        let cache = CacheTier::new(
            MemoryBackend::new(128, policy(), ProtectedKeys::default(), clock.clone()),
            MemoryBackend::new(1024, policy(), ProtectedKeys::default(), clock.clone()),
            TtlCalculator::new(TtlConfig::default()),
            Arc::new(CacheAnalytics::new()),
            Arc::new(AccessPatterns::new(WarmerConfig::default())),
            clock,
        );
        QueryService::new(QueryExecutor::new(arbitration, cache))
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let service = service();
        let id = service
            .submit("EVALUATE TSLA: PRICE, VOLATILITY(30d)")
            .unwrap();
        let task = service.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);
        let result = task.result.unwrap();
        assert!(result.get("fetch_tsla_price").is_some());
        assert!(result.get("volatility_tsla_30d").is_some());
        assert!(task.partial_results.contains_key("fetch_tsla_history_30d"));
    }

    #[tokio::test]
    async fn test_parse_error_surfaces_synchronously() {
        let err = service().submit("EVALUATE TSLA: BOGUS").unwrap_err();
        assert!(matches!(err, EngineError::UnknownMetric { .. }));
    }

    #[tokio::test]
    async fn test_failed_query_keeps_healthy_partials() {
        let service = service();
        let id = service.submit("COMPARE BADCO vs MSFT ON: PRICE").unwrap();
        let task = service.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.error.unwrap();
        assert_eq!(error.code, "STEP_FAILED");
        assert!(task.partial_results.contains_key("fetch_msft_price"));
        assert!(!task.partial_results.contains_key("fetch_badco_price"));
        // Three-step plan, only the MSFT fetch completed.
        assert!(
            (task.progress - 1.0 / 3.0).abs() < 1e-9,
            "failed steps must not advance progress, got {}",
            task.progress
        );
    }

    #[tokio::test]
    async fn test_unknown_task_id() {
        let err = service().status(&Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound(_)));
    }

    #[test]
    fn test_task_snapshot_serializes() {
        let mut task = Task::new("EVALUATE TSLA: PRICE");
        task.partial_results
            .insert("fetch_tsla_price".into(), serde_json::json!(42.0));
        task.error = Some(ErrorResponse {
            code: "STEP_FAILED".into(),
            message: "fetch_tsla_price failed".into(),
            retryable: true,
        });
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "pending");
        let _: HashMap<String, serde_json::Value> =
            serde_json::from_value(json["partial_results"].clone()).unwrap();
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back.error.unwrap().code, "STEP_FAILED");
    }
}
