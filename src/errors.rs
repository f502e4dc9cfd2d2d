use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All engine errors, categorized by domain.
///
/// `Clone` lets single-flight followers receive the leader's failure
/// unaltered.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    // ── Provider ──
    #[error("Provider error from {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("Provider {provider} rate limited (retry after {retry_after:?})")]
    ProviderRateLimit {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {timeout:?}")]
    ProviderTimeout { provider: String, timeout: Duration },

    #[error("No provider available: all {attempts} candidates failed for {data_type}")]
    NoProviderAvailable { attempts: usize, data_type: String },

    #[error("Provider {0} does not support the requested asset/data type")]
    UnsupportedRequest(String),

    // ── DSL ──
    #[error("Parse error at position {position}: {message}")]
    DslParse { position: usize, message: String },

    #[error("Unknown metric '{name}' at position {position}")]
    UnknownMetric { name: String, position: usize },

    // ── Planning / Execution ──
    #[error("Execution plan contains a dependency cycle: {0}")]
    PlanCycle(String),

    #[error("Step {step} failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Conflict resolution needs at least one value")]
    EmptyConflictSet,

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    // ── Cache ──
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    #[error("Cache at capacity and all resident entries are protected")]
    CacheFullProtected,

    // ── Configuration ──
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Serialization ──
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ── General ──
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the caller could reasonably retry the whole operation.
    ///
    /// Parse and configuration errors are caller bugs, never retryable.
    /// Cache errors are absorbed internally and only surface when the
    /// degraded path also failed, which maps back to provider exhaustion.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Provider { .. }
            | EngineError::ProviderRateLimit { .. }
            | EngineError::ProviderTimeout { .. }
            | EngineError::NoProviderAvailable { .. }
            | EngineError::CacheBackend(_)
            | EngineError::StepFailed { .. }
            | EngineError::Internal(_) => true,
            EngineError::UnsupportedRequest(_)
            | EngineError::DslParse { .. }
            | EngineError::UnknownMetric { .. }
            | EngineError::PlanCycle(_)
            | EngineError::EmptyConflictSet
            | EngineError::TaskNotFound(_)
            | EngineError::CacheFullProtected
            | EngineError::InvalidConfig(_)
            | EngineError::Serialization(_) => false,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Provider { .. } => "PROVIDER",
            EngineError::ProviderRateLimit { .. } => "PROVIDER_RATE_LIMIT",
            EngineError::ProviderTimeout { .. } => "PROVIDER_TIMEOUT",
            EngineError::NoProviderAvailable { .. } => "NO_PROVIDER_AVAILABLE",
            EngineError::UnsupportedRequest(_) => "UNSUPPORTED_REQUEST",
            EngineError::DslParse { .. } => "DSL_PARSE",
            EngineError::UnknownMetric { .. } => "UNKNOWN_METRIC",
            EngineError::PlanCycle(_) => "PLAN_CYCLE",
            EngineError::StepFailed { .. } => "STEP_FAILED",
            EngineError::EmptyConflictSet => "EMPTY_CONFLICT_SET",
            EngineError::TaskNotFound(_) => "TASK_NOT_FOUND",
            EngineError::CacheBackend(_) => "CACHE_BACKEND",
            EngineError::CacheFullProtected => "CACHE_FULL_PROTECTED",
            EngineError::InvalidConfig(_) => "INVALID_CONFIG",
            EngineError::Serialization(_) => "SERIALIZATION",
            EngineError::Internal(_) => "INTERNAL",
        }
    }
}

/// Serializable error shape handed to Query API callers.
///
/// Carries enough structure (code + retryable) for the caller to decide
/// whether to retry the whole query, retry one branch, or accept partials.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for ErrorResponse {
    fn from(err: &EngineError) -> Self {
        ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let transient = EngineError::Provider {
            provider: "alpha".into(),
            message: "502".into(),
        };
        assert!(transient.is_retryable());

        let parse = EngineError::DslParse {
            position: 12,
            message: "unexpected token".into(),
        };
        assert!(!parse.is_retryable());

        let exhausted = EngineError::NoProviderAvailable {
            attempts: 3,
            data_type: "price".into(),
        };
        assert!(exhausted.is_retryable());
    }

    #[test]
    fn test_error_response_carries_code_and_flag() {
        let err = EngineError::ProviderRateLimit {
            provider: "beta".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        let resp = ErrorResponse::from(&err);
        assert_eq!(resp.code, "PROVIDER_RATE_LIMIT");
        assert!(resp.retryable);
        assert!(resp.message.contains("beta"));
    }
}
