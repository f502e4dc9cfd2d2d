use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::arbitration::ArbitrationEngine;
use crate::cache::{CacheKey, CacheTier};
use crate::dsl::ast::Condition;
use crate::errors::EngineError;
use crate::models::{
    ComputeOp, DataRequest, ExecutionPlan, ExecutionStep, Payload, StepId, StepKind, StepStatus,
};

/// Terminal state of one step, reported through the progress callback.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed(Value),
    Failed(String),
}

/// Runs execution plans as DAGs: independent steps run concurrently,
/// a step starts once all of its dependencies have completed, and a
/// failed dependency fails its dependents without running them. Fetch
/// steps go through the cache with arbitration as the miss path.
pub struct QueryExecutor {
    arbitration: Arc<ArbitrationEngine>,
    cache: Arc<CacheTier>,
}

impl QueryExecutor {
    pub fn new(arbitration: Arc<ArbitrationEngine>, cache: Arc<CacheTier>) -> Arc<Self> {
        Arc::new(Self { arbitration, cache })
    }

    /// Execute a plan to completion. `on_step` fires once per step as it
    /// reaches a terminal state, in completion order. Returns the
    /// aggregate step's output, or the first real failure; steps on
    /// branches unaffected by a failure still run to completion.
    pub async fn execute<F>(
        &self,
        plan: &ExecutionPlan,
        mut on_step: F,
    ) -> Result<Value, EngineError>
    where
        F: FnMut(&str, &StepOutcome),
    {
        let mut status: HashMap<StepId, StepStatus> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        let mut outputs: HashMap<StepId, Value> = HashMap::new();
        let mut first_failure: Option<(StepId, String)> = None;

        loop {
            // Settle steps whose dependencies failed before spawning the
            // next wave, so failures cascade transitively in one pass.
            let mut cascaded = false;
            for step in &plan.steps {
                if status[&step.id] != StepStatus::Pending {
                    continue;
                }
                let failed_dep = step
                    .depends_on
                    .iter()
                    .find(|d| status[d.as_str()] == StepStatus::Failed);
                if let Some(dep) = failed_dep {
                    let message = format!("dependency '{dep}' failed");
                    status.insert(step.id.clone(), StepStatus::Failed);
                    on_step(&step.id, &StepOutcome::Failed(message));
                    cascaded = true;
                }
            }
            if cascaded {
                continue;
            }

            let ready: Vec<&ExecutionStep> = plan
                .steps
                .iter()
                .filter(|s| {
                    status[&s.id] == StepStatus::Pending
                        && s.depends_on
                            .iter()
                            .all(|d| status[d.as_str()] == StepStatus::Completed)
                })
                .collect();
            if ready.is_empty() {
                break;
            }

            let mut wave: JoinSet<(StepId, Result<Value, EngineError>)> = JoinSet::new();
            for step in ready {
                status.insert(step.id.clone(), StepStatus::Running);
                self.spawn_step(&mut wave, step, &outputs);
            }

            while let Some(joined) = wave.join_next().await {
                let (id, result) = joined
                    .map_err(|e| EngineError::Internal(format!("step task panicked: {e}")))?;
                match result {
                    Ok(value) => {
                        debug!(step = %id, "step completed");
                        status.insert(id.clone(), StepStatus::Completed);
                        on_step(&id, &StepOutcome::Completed(value.clone()));
                        outputs.insert(id, value);
                    }
                    Err(err) => {
                        warn!(step = %id, %err, "step failed");
                        let message = err.to_string();
                        status.insert(id.clone(), StepStatus::Failed);
                        on_step(&id, &StepOutcome::Failed(message.clone()));
                        if first_failure.is_none() {
                            first_failure = Some((id, message));
                        }
                    }
                }
            }
        }

        if let Some((step, message)) = first_failure {
            return Err(EngineError::StepFailed { step, message });
        }
        outputs
            .remove("aggregate")
            .ok_or_else(|| EngineError::Internal("plan has no aggregate step".into()))
    }

    fn spawn_step(
        &self,
        wave: &mut JoinSet<(StepId, Result<Value, EngineError>)>,
        step: &ExecutionStep,
        outputs: &HashMap<StepId, Value>,
    ) {
        let id = step.id.clone();
        match step.kind {
            StepKind::Fetch => {
                let Some(request) = step.request.clone() else {
                    wave.spawn(async move {
                        let err = EngineError::Internal(format!("fetch step '{id}' has no request"));
                        (id, Err(err))
                    });
                    return;
                };
                let arbitration = self.arbitration.clone();
                let cache = self.cache.clone();
                wave.spawn(async move {
                    let result = fetch_step(arbitration, cache, request).await;
                    (id, result)
                });
            }
            StepKind::Compute => {
                let op = step.compute.clone();
                let inputs: Vec<Value> = step
                    .depends_on
                    .iter()
                    .filter_map(|d| outputs.get(d).cloned())
                    .collect();
                wave.spawn(async move {
                    let result = match op {
                        Some(op) => run_compute(&op, &inputs),
                        None => Err(EngineError::Internal(format!(
                            "compute step '{id}' has no operation"
                        ))),
                    };
                    (id, result)
                });
            }
            StepKind::Aggregate => {
                let mut map = serde_json::Map::new();
                for dep in &step.depends_on {
                    if let Some(value) = outputs.get(dep) {
                        map.insert(dep.clone(), value.clone());
                    }
                }
                wave.spawn(async move { (id, Ok(Value::Object(map))) });
            }
        }
    }
}

async fn fetch_step(
    arbitration: Arc<ArbitrationEngine>,
    cache: Arc<CacheTier>,
    request: DataRequest,
) -> Result<Value, EngineError> {
    let key = CacheKey::for_request(&request.asset, request.data_type, request.qualifier.as_deref());
    let class = request.asset.class;
    let max_staleness = request.requirements.max_staleness;
    let payload = cache
        .get_or_fetch(&key, class, max_staleness, || async {
            arbitration.resolve(&request).await.map(|r| r.payload)
        })
        .await?;
    Ok(serde_json::to_value(payload)?)
}

fn run_compute(op: &ComputeOp, inputs: &[Value]) -> Result<Value, EngineError> {
    match op {
        ComputeOp::Volatility { window_days } => {
            let values = tail(&series_values(input(inputs, 0)?)?, *window_days as usize + 1);
            Ok(json!(annualized_volatility(&values)?))
        }
        ComputeOp::Sma { period } => {
            let values = series_values(input(inputs, 0)?)?;
            Ok(json!(simple_moving_average(&values, *period)?))
        }
        ComputeOp::Rsi { period } => {
            let values = series_values(input(inputs, 0)?)?;
            Ok(json!(relative_strength_index(&values, *period)?))
        }
        ComputeOp::Change { window_days } => {
            let values = series_values(input(inputs, 0)?)?;
            Ok(json!(percent_change(&values, *window_days as usize)?))
        }
        ComputeOp::Correlation => {
            let a = series_values(input(inputs, 0)?)?;
            let b = series_values(input(inputs, 1)?)?;
            Ok(json!(pearson_correlation(&a, &b)?))
        }
        ComputeOp::Filter { conditions } => filter_universe(input(inputs, 0)?, conditions),
        ComputeOp::MacroAnalysis { analysis_type } => macro_analysis(inputs, analysis_type),
    }
}

fn input(inputs: &[Value], index: usize) -> Result<&Value, EngineError> {
    inputs
        .get(index)
        .ok_or_else(|| EngineError::Internal(format!("compute input {index} missing")))
}

fn payload_of(value: &Value) -> Result<Payload, EngineError> {
    Ok(serde_json::from_value(value.clone())?)
}

fn series_values(value: &Value) -> Result<Vec<f64>, EngineError> {
    match payload_of(value)? {
        Payload::Series { points } => Ok(points.into_iter().map(|(_, v)| v).collect()),
        other => Err(EngineError::Internal(format!(
            "expected a series input, got {}",
            payload_kind(&other)
        ))),
    }
}

fn payload_kind(payload: &Payload) -> &'static str {
    match payload {
        Payload::Price { .. } => "price",
        Payload::Ohlcv(_) => "ohlcv",
        Payload::Series { .. } => "series",
        Payload::Fundamentals(_) => "fundamentals",
        Payload::Sentiment(_) => "sentiment",
        Payload::News { .. } => "news",
        Payload::Universe { .. } => "universe",
    }
}

fn tail(values: &[f64], n: usize) -> Vec<f64> {
    values[values.len().saturating_sub(n)..].to_vec()
}

/// Annualized standard deviation of daily log returns, in percent.
fn annualized_volatility(values: &[f64]) -> Result<f64, EngineError> {
    if values.len() < 2 {
        return Err(EngineError::Internal(
            "volatility needs at least two points".into(),
        ));
    }
    let returns: Vec<f64> = values
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 2 {
        return Err(EngineError::Internal(
            "volatility needs at least two positive returns".into(),
        ));
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    Ok(variance.sqrt() * (252.0_f64).sqrt() * 100.0)
}

fn simple_moving_average(values: &[f64], period: usize) -> Result<f64, EngineError> {
    if period == 0 || values.len() < period {
        return Err(EngineError::Internal(format!(
            "sma({period}) needs {period} points, have {}",
            values.len()
        )));
    }
    let window = &values[values.len() - period..];
    Ok(window.iter().sum::<f64>() / period as f64)
}

fn relative_strength_index(values: &[f64], period: usize) -> Result<f64, EngineError> {
    if period == 0 || values.len() < period + 1 {
        return Err(EngineError::Internal(format!(
            "rsi({period}) needs {} points, have {}",
            period + 1,
            values.len()
        )));
    }
    let diffs: Vec<f64> = values[values.len() - period - 1..]
        .windows(2)
        .map(|w| w[1] - w[0])
        .collect();
    let gains: f64 = diffs.iter().filter(|d| **d > 0.0).sum();
    let losses: f64 = diffs.iter().filter(|d| **d < 0.0).map(|d| -d).sum();
    if losses == 0.0 {
        return Ok(100.0);
    }
    let rs = (gains / period as f64) / (losses / period as f64);
    Ok(100.0 - 100.0 / (1.0 + rs))
}

fn percent_change(values: &[f64], window: usize) -> Result<f64, EngineError> {
    if values.len() < 2 {
        return Err(EngineError::Internal(
            "change needs at least two points".into(),
        ));
    }
    let last = values[values.len() - 1];
    let base_idx = values.len().saturating_sub(window + 1);
    let base = values[base_idx];
    if base == 0.0 {
        return Err(EngineError::Internal("change base value is zero".into()));
    }
    Ok((last - base) / base * 100.0)
}

fn pearson_correlation(a: &[f64], b: &[f64]) -> Result<f64, EngineError> {
    let n = a.len().min(b.len());
    if n < 2 {
        return Err(EngineError::Internal(
            "correlation needs at least two aligned points".into(),
        ));
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return Err(EngineError::Internal(
            "correlation undefined for a constant series".into(),
        ));
    }
    Ok(cov / (var_a.sqrt() * var_b.sqrt()))
}

fn filter_universe(value: &Value, conditions: &[Condition]) -> Result<Value, EngineError> {
    let rows = match payload_of(value)? {
        Payload::Universe { rows } => rows,
        other => {
            return Err(EngineError::Internal(format!(
                "expected a universe input, got {}",
                payload_kind(&other)
            )))
        }
    };
    let matches: Vec<_> = rows
        .into_iter()
        .filter(|row| {
            conditions.iter().all(|c| {
                row.fields
                    .get(&c.field)
                    .is_some_and(|v| c.op.holds(*v, c.value))
            })
        })
        .collect();
    Ok(serde_json::to_value(matches)?)
}

/// Reads each indicator series' drift over its window and labels the
/// overall regime from the average.
fn macro_analysis(inputs: &[Value], analysis_type: &str) -> Result<Value, EngineError> {
    let mut drifts = Vec::new();
    let mut target_price = None;
    for value in inputs {
        match payload_of(value)? {
            Payload::Series { points } if points.len() >= 2 => {
                let first = points[0].1;
                let last = points[points.len() - 1].1;
                if first != 0.0 {
                    drifts.push((last - first) / first * 100.0);
                }
            }
            Payload::Price { value } => target_price = Some(value),
            _ => {}
        }
    }
    if drifts.is_empty() {
        return Err(EngineError::Internal(
            "macro analysis needs at least one indicator series".into(),
        ));
    }
    let avg = drifts.iter().sum::<f64>() / drifts.len() as f64;
    let signal = if avg > 1.0 {
        "expansionary"
    } else if avg < -1.0 {
        "contractionary"
    } else {
        "neutral"
    };
    Ok(json!({
        "analysis_type": analysis_type,
        "signal": signal,
        "indicator_drift_pct": avg,
        "target_price": target_price,
    }))
}
