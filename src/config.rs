use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Component weights for provider scoring. Must sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub freshness: f64,
    pub latency: f64,
    pub uptime: f64,
    pub completeness: f64,
    pub reliability: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            freshness: 0.30,
            latency: 0.25,
            uptime: 0.20,
            completeness: 0.15,
            reliability: 0.10,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.freshness + self.latency + self.uptime + self.completeness + self.reliability
    }
}

/// Cache sizing, eviction and protection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub l1_capacity: usize,
    pub l2_capacity: usize,
    pub policy: EvictionPolicyKind,
    /// Hybrid policy: weight on recency vs frequency, in [0, 1].
    pub hybrid_recency_weight: f64,
    /// Exact keys or `prefix*` patterns that are never evicted.
    pub protected_patterns: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            l2_capacity: 100_000,
            policy: EvictionPolicyKind::Hybrid,
            hybrid_recency_weight: 0.6,
            protected_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyKind {
    Lru,
    Lfu,
    Hybrid,
}

/// Base TTLs per data type plus the market-hours modifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    pub price: Duration,
    pub ohlcv: Duration,
    pub history: Duration,
    pub fundamentals: Duration,
    pub news: Duration,
    pub sentiment: Duration,
    /// Multiplier while the relevant market is open (< 1 shortens).
    pub market_open_factor: f64,
    /// Multiplier after hours / weekends (> 1 lengthens).
    pub after_hours_factor: f64,
    /// Extra shortening for high-volatility asset classes.
    pub volatile_class_factor: f64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            price: Duration::from_secs(120),
            ohlcv: Duration::from_secs(300),
            history: Duration::from_secs(1800),
            fundamentals: Duration::from_secs(21_600),
            news: Duration::from_secs(600),
            sentiment: Duration::from_secs(900),
            market_open_factor: 0.5,
            after_hours_factor: 3.0,
            volatile_class_factor: 0.5,
        }
    }
}

/// Predictive warmer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmerConfig {
    pub interval: Duration,
    /// How many of the highest-priority keys each pass refreshes.
    pub top_k: usize,
    /// Added to priority for keys inside a known event window.
    pub event_boost: f64,
    /// Minimum observed requests before a key is a warming candidate.
    pub min_frequency: u64,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            top_k: 32,
            event_boost: 10.0,
            min_frequency: 3,
        }
    }
}

/// Batch update scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Time window after which a partially-filled batch flushes anyway.
    pub window: Duration,
    /// Flush immediately once a (provider, data type) group reaches this size.
    pub max_batch_size: usize,
    /// UTC hours during which deferrable refreshes prefer to run.
    pub low_load_hours_utc: Vec<u32>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            max_batch_size: 25,
            low_load_hours_utc: vec![2, 3, 4],
        }
    }
}

/// All engine tunables in one injected object. No globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scoring: ScoringWeights,
    #[serde(default = "default_outlier_sigma")]
    pub outlier_sigma: f64,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout: Duration,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub warmer: WarmerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringWeights::default(),
            outlier_sigma: default_outlier_sigma(),
            attempt_timeout: default_attempt_timeout(),
            cache: CacheConfig::default(),
            ttl: TtlConfig::default(),
            warmer: WarmerConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

fn default_outlier_sigma() -> f64 {
    2.0
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(5)
}

impl EngineConfig {
    /// Reject configurations that would break scoring or cache invariants.
    pub fn validate(&self) -> Result<(), EngineError> {
        let sum = self.scoring.sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(EngineError::InvalidConfig(format!(
                "scoring weights must sum to 1.0, got {sum}"
            )));
        }
        if self.outlier_sigma <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "outlier_sigma must be positive".into(),
            ));
        }
        if self.cache.l1_capacity == 0 || self.cache.l2_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "cache capacities must be nonzero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cache.hybrid_recency_weight) {
            return Err(EngineError::InvalidConfig(
                "hybrid_recency_weight must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_defaults_match_serde_fallbacks() {
        let cfg = EngineConfig::default();
        assert!((cfg.outlier_sigma - 2.0).abs() < 1e-12);
        assert_eq!(cfg.attempt_timeout, Duration::from_secs(5));

        let from_empty: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!((from_empty.outlier_sigma - cfg.outlier_sigma).abs() < 1e-12);
        assert_eq!(from_empty.attempt_timeout, cfg.attempt_timeout);
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = ScoringWeights::default();
        assert!((w.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_bad_weights_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.scoring.freshness = 0.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }
}
