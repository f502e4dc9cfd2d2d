use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::asset::DataType;

/// Identifies one upstream data source.
pub type ProviderId = String;

/// A single OHLCV bar as reported by one provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A fundamentals snapshot. `filing_date` decides merge precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fundamentals {
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub eps: Option<f64>,
    pub revenue: Option<f64>,
    pub filing_date: DateTime<Utc>,
}

/// Aggregated sentiment from one source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    /// Signed score in [-1, 1].
    pub score: f64,
    /// Source credibility in [0, 1]; weights the cross-source average.
    pub credibility: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headline {
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
}

/// One instrument inside a market snapshot, keyed by screener fields
/// such as "volume" or "change".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseRow {
    pub symbol: String,
    pub fields: std::collections::HashMap<String, f64>,
}

/// Payloads a provider can return. Closed set so merge and conflict
/// resolution can be matched exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Price { value: f64 },
    Ohlcv(OhlcvBar),
    /// Time-ordered (timestamp, value) points for derived metrics.
    Series { points: Vec<(DateTime<Utc>, f64)> },
    Fundamentals(Fundamentals),
    Sentiment(SentimentReading),
    News { headlines: Vec<Headline> },
    /// Market-wide snapshot used by screener queries.
    Universe { rows: Vec<UniverseRow> },
}

impl Payload {
    /// Scalar view used by conflict resolution. Series/news have no single
    /// numeric value and do not participate in numeric conflict handling.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            Payload::Price { value } => Some(*value),
            Payload::Ohlcv(bar) => Some(bar.close),
            Payload::Sentiment(s) => Some(s.score),
            Payload::Fundamentals(_)
            | Payload::Series { .. }
            | Payload::News { .. }
            | Payload::Universe { .. } => None,
        }
    }
}

/// One provider's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider_id: ProviderId,
    pub payload: Payload,
    /// When the provider says the data was observed, not when we received it.
    pub source_timestamp: DateTime<Utc>,
    /// Provider-reported confidence in [0, 1].
    pub confidence: f64,
}

/// Per-provider rolling metrics snapshot. Owned by the score tracker;
/// arbitration only ever reads copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub provider_id: ProviderId,
    /// Age of the provider's most recent successful update.
    pub freshness: Duration,
    pub latency_p95: Duration,
    /// Fraction of the last 24h the provider answered health checks.
    pub uptime_24h: f64,
    /// Fraction of requested fields the provider actually fills.
    pub completeness: f64,
    /// Success rate over the bounded outcome window.
    pub reliability: f64,
    /// Set while the provider has told us to back off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<DateTime<Utc>>,
}

/// Weighted component breakdown, always summing to `total`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub freshness: f64,
    pub latency: f64,
    pub uptime: f64,
    pub completeness: f64,
    pub reliability: f64,
}

/// Arbitration score for one candidate provider. Total in [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderScore {
    pub provider_id: ProviderId,
    pub total: f64,
    pub components: ScoreComponents,
}

/// How multi-provider answers get combined, selected by data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Open from earliest ts, close from latest, high=max, low=min, vol=sum.
    OhlcvComposite,
    /// Most recent filing timestamp wins outright, no averaging.
    LatestFiling,
    /// Credibility-weighted average of sentiment scores.
    CredibilityWeighted,
    /// Most recent source timestamp wins. Default for unknown shapes.
    LatestWins,
}

impl MergeStrategy {
    pub fn for_data_type(data_type: DataType) -> Self {
        match data_type {
            DataType::Ohlcv => MergeStrategy::OhlcvComposite,
            DataType::Fundamentals => MergeStrategy::LatestFiling,
            DataType::Sentiment => MergeStrategy::CredibilityWeighted,
            DataType::Price | DataType::History | DataType::News => MergeStrategy::LatestWins,
        }
    }
}

/// Ordered attempt list for one request. Created fresh per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationPlan {
    pub primary: ProviderId,
    /// Next-best candidates, descending score. Two in practice.
    pub fallbacks: Vec<ProviderId>,
    pub merge_strategy: MergeStrategy,
    /// Primary's latency p95; what the caller should expect to wait.
    pub estimated_latency: Duration,
}

impl ArbitrationPlan {
    /// Primary followed by fallbacks, in attempt order.
    pub fn attempt_order(&self) -> impl Iterator<Item = &ProviderId> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }
}

/// Tag recording which statistical procedure produced a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    TrustWeightedMean,
    SingleSource,
    MedianOnly,
}

/// Outcome of numeric conflict resolution across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedValue {
    pub value: f64,
    /// 1 / (1 + variance of surviving values).
    pub confidence: f64,
    pub sources_used: usize,
    pub outliers_discarded: usize,
    pub method: ResolutionMethod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_strategy_by_data_type() {
        assert_eq!(
            MergeStrategy::for_data_type(DataType::Ohlcv),
            MergeStrategy::OhlcvComposite
        );
        assert_eq!(
            MergeStrategy::for_data_type(DataType::Fundamentals),
            MergeStrategy::LatestFiling
        );
        assert_eq!(
            MergeStrategy::for_data_type(DataType::News),
            MergeStrategy::LatestWins
        );
    }

    #[test]
    fn test_attempt_order_puts_primary_first() {
        let plan = ArbitrationPlan {
            primary: "alpha".into(),
            fallbacks: vec!["beta".into(), "gamma".into()],
            merge_strategy: MergeStrategy::LatestWins,
            estimated_latency: Duration::from_millis(120),
        };
        let order: Vec<&str> = plan.attempt_order().map(|s| s.as_str()).collect();
        assert_eq!(order, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_payload_scalar_view() {
        assert_eq!(Payload::Price { value: 42.0 }.scalar(), Some(42.0));
        assert_eq!(
            Payload::Series { points: vec![] }.scalar(),
            None
        );
    }
}
