use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dsl::ast::Condition;
use crate::errors::{EngineError, ErrorResponse};

use super::asset::DataRequest;

/// Identifies one step inside an execution plan, e.g. "fetch_tsla_history".
pub type StepId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Fetch,
    Compute,
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// What a compute step actually calculates over its dependency outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ComputeOp {
    /// Annualized std-dev of log returns over the input series.
    Volatility { window_days: u32 },
    /// Simple moving average of the input series tail.
    Sma { period: usize },
    /// Relative strength index over the input series.
    Rsi { period: usize },
    /// Percent change over the window.
    Change { window_days: u32 },
    /// Pearson correlation between two input series.
    Correlation,
    /// Filter a fetched universe against screener conditions.
    Filter { conditions: Vec<Condition> },
    /// Macro regime read from a set of indicator fetches.
    MacroAnalysis { analysis_type: String },
}

/// One node of the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: StepId,
    pub kind: StepKind,
    /// Populated for fetch steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<DataRequest>,
    /// Populated for compute steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeOp>,
    /// Ids of steps whose outputs this step consumes.
    pub depends_on: Vec<StepId>,
    pub status: StepStatus,
}

impl ExecutionStep {
    pub fn fetch(id: &str, request: DataRequest) -> Self {
        Self {
            id: id.to_string(),
            kind: StepKind::Fetch,
            request: Some(request),
            compute: None,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
        }
    }

    pub fn compute(id: &str, op: ComputeOp, depends_on: Vec<StepId>) -> Self {
        Self {
            id: id.to_string(),
            kind: StepKind::Compute,
            request: None,
            compute: Some(op),
            depends_on,
            status: StepStatus::Pending,
        }
    }

    pub fn aggregate(id: &str, depends_on: Vec<StepId>) -> Self {
        Self {
            id: id.to_string(),
            kind: StepKind::Aggregate,
            request: None,
            compute: None,
            depends_on,
            status: StepStatus::Pending,
        }
    }
}

/// A dependency-ordered set of steps. Cycle-free by construction:
/// `new` runs a topological check and refuses cyclic input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub steps: Vec<ExecutionStep>,
    pub estimated_duration: Duration,
}

impl ExecutionPlan {
    pub fn new(steps: Vec<ExecutionStep>, estimated_duration: Duration) -> Result<Self, EngineError> {
        Self::check_acyclic(&steps)?;
        Ok(Self {
            steps,
            estimated_duration,
        })
    }

    /// Kahn's algorithm. Also rejects dependencies on unknown step ids.
    fn check_acyclic(steps: &[ExecutionStep]) -> Result<(), EngineError> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in steps {
            indegree.entry(step.id.as_str()).or_insert(0);
            for dep in &step.depends_on {
                if !steps.iter().any(|s| s.id == *dep) {
                    return Err(EngineError::PlanCycle(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
                *indegree.entry(step.id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = ready.pop() {
            visited += 1;
            if let Some(children) = dependents.get(id) {
                for child in children {
                    let d = indegree.get_mut(child).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        ready.push(child);
                    }
                }
            }
        }

        if visited != steps.len() {
            let stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(EngineError::PlanCycle(format!(
                "cycle involving steps: {}",
                stuck.join(", ")
            )));
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One submitted query's lifecycle. Mutated by the executor as steps
/// finish; callers poll snapshots through the query service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub query: String,
    pub status: TaskStatus,
    /// completed_steps / total_steps, in [0, 1].
    pub progress: f64,
    /// Step outputs, filled incrementally as each step completes.
    pub partial_results: HashMap<StepId, serde_json::Value>,
    /// Aggregate output, set once the terminal step completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn new(query: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.to_string(),
            status: TaskStatus::Pending,
            progress: 0.0,
            partial_results: HashMap::new(),
            result: None,
            error: None,
            submitted_at: Utc::now(),
        }
    }
}
