use statrs::statistics::{Data, Distribution, OrderStatistics};
use tracing::debug;

use crate::errors::EngineError;
use crate::models::{
    MergeStrategy, OhlcvBar, Payload, ProviderResponse, ResolutionMethod, ResolvedValue,
    SentimentReading,
};

/// Combine multiple providers' answers for one request.
///
/// Deterministic with respect to data content (timestamps, values), never
/// response arrival order; callers may pass responses in any order.
pub fn merge(
    mut responses: Vec<ProviderResponse>,
    strategy: MergeStrategy,
) -> Result<ProviderResponse, EngineError> {
    if responses.is_empty() {
        return Err(EngineError::EmptyConflictSet);
    }
    if responses.len() == 1 {
        return Ok(responses.remove(0));
    }
    // Canonical order: source timestamp, provider id as tiebreak.
    responses.sort_by(|a, b| {
        a.source_timestamp
            .cmp(&b.source_timestamp)
            .then_with(|| a.provider_id.cmp(&b.provider_id))
    });

    match strategy {
        MergeStrategy::OhlcvComposite => merge_ohlcv(responses),
        MergeStrategy::LatestFiling => merge_latest_filing(responses),
        MergeStrategy::CredibilityWeighted => merge_sentiment(responses),
        MergeStrategy::LatestWins => Ok(responses.pop().expect("nonempty")),
    }
}

/// Open from the earliest bar, close from the latest, high = max,
/// low = min, volume = sum. Callers must pre-deduplicate same-venue
/// double counting before summing volume.
fn merge_ohlcv(responses: Vec<ProviderResponse>) -> Result<ProviderResponse, EngineError> {
    let bars: Vec<(&ProviderResponse, OhlcvBar)> = responses
        .iter()
        .filter_map(|r| match &r.payload {
            Payload::Ohlcv(bar) => Some((r, *bar)),
            _ => None,
        })
        .collect();
    if bars.is_empty() {
        return Err(EngineError::Internal(
            "ohlcv merge invoked with no ohlcv payloads".into(),
        ));
    }

    // `responses` is sorted by source timestamp, so first/last are
    // earliest/latest regardless of arrival order.
    let open = bars.first().map(|(_, b)| b.open).unwrap();
    let close = bars.last().map(|(_, b)| b.close).unwrap();
    let high = bars.iter().map(|(_, b)| b.high).fold(f64::MIN, f64::max);
    let low = bars.iter().map(|(_, b)| b.low).fold(f64::MAX, f64::min);
    let volume = bars.iter().map(|(_, b)| b.volume).sum();

    let latest = bars.last().map(|(r, _)| *r).unwrap();
    let confidence = bars.iter().map(|(r, _)| r.confidence).sum::<f64>() / bars.len() as f64;

    Ok(ProviderResponse {
        provider_id: format!("merged({})", bars.len()),
        payload: Payload::Ohlcv(OhlcvBar {
            open,
            high,
            low,
            close,
            volume,
        }),
        source_timestamp: latest.source_timestamp,
        confidence,
    })
}

/// The most recent filing wins outright; stale filings are never averaged in.
fn merge_latest_filing(responses: Vec<ProviderResponse>) -> Result<ProviderResponse, EngineError> {
    responses
        .into_iter()
        .filter(|r| matches!(r.payload, Payload::Fundamentals(_)))
        .max_by_key(|r| match &r.payload {
            Payload::Fundamentals(f) => f.filing_date,
            _ => unreachable!(),
        })
        .ok_or_else(|| {
            EngineError::Internal("fundamentals merge invoked with no fundamentals payloads".into())
        })
}

/// Credibility-weighted average of sentiment scores.
fn merge_sentiment(responses: Vec<ProviderResponse>) -> Result<ProviderResponse, EngineError> {
    let readings: Vec<(&ProviderResponse, SentimentReading)> = responses
        .iter()
        .filter_map(|r| match &r.payload {
            Payload::Sentiment(s) => Some((r, *s)),
            _ => None,
        })
        .collect();
    if readings.is_empty() {
        return Err(EngineError::Internal(
            "sentiment merge invoked with no sentiment payloads".into(),
        ));
    }

    let total_weight: f64 = readings.iter().map(|(_, s)| s.credibility).sum();
    let score = if total_weight > 0.0 {
        readings
            .iter()
            .map(|(_, s)| s.score * s.credibility)
            .sum::<f64>()
            / total_weight
    } else {
        readings.iter().map(|(_, s)| s.score).sum::<f64>() / readings.len() as f64
    };
    let credibility =
        readings.iter().map(|(_, s)| s.credibility).sum::<f64>() / readings.len() as f64;

    let latest = readings.last().map(|(r, _)| *r).unwrap();
    Ok(ProviderResponse {
        provider_id: format!("merged({})", readings.len()),
        payload: Payload::Sentiment(SentimentReading { score, credibility }),
        source_timestamp: latest.source_timestamp,
        confidence: credibility,
    })
}

/// Reconcile disagreeing numeric values for one field.
///
/// Median and std-dev across all reported values; values farther than
/// `outlier_sigma` standard deviations from the median are discarded;
/// the survivors are combined as a trust-weighted average. Confidence is
/// `1 / (1 + variance of survivors)`. Counts are surfaced for audit.
pub fn resolve_conflict(
    samples: &[(f64, f64)],
    outlier_sigma: f64,
) -> Result<ResolvedValue, EngineError> {
    if samples.is_empty() {
        return Err(EngineError::EmptyConflictSet);
    }
    if samples.len() == 1 {
        return Ok(ResolvedValue {
            value: samples[0].0,
            confidence: 1.0,
            sources_used: 1,
            outliers_discarded: 0,
            method: ResolutionMethod::SingleSource,
        });
    }

    let values: Vec<f64> = samples.iter().map(|(v, _)| *v).collect();
    // Population std-dev: the samples are the entire disagreement set, not
    // a draw from a larger one. The sample estimator widens the band enough
    // to keep gross outliers in small sets.
    let std_dev = population_std_dev(&values);
    let mut data = Data::new(values);
    let median = data.median();

    // Zero spread keeps everything; any threshold would too.
    let survivors: Vec<(f64, f64)> = if std_dev > 0.0 {
        samples
            .iter()
            .copied()
            .filter(|(v, _)| (v - median).abs() <= outlier_sigma * std_dev)
            .collect()
    } else {
        samples.to_vec()
    };
    let outliers_discarded = samples.len() - survivors.len();
    if outliers_discarded > 0 {
        debug!(
            discarded = outliers_discarded,
            median, std_dev, "discarded conflicting outliers"
        );
    }

    // All survivors carrying zero trust degrade to the plain median.
    let total_trust: f64 = survivors.iter().map(|(_, t)| *t).sum();
    let (value, method) = if total_trust > 0.0 {
        let weighted = survivors.iter().map(|(v, t)| v * t).sum::<f64>() / total_trust;
        (weighted, ResolutionMethod::TrustWeightedMean)
    } else {
        (median, ResolutionMethod::MedianOnly)
    };

    let surviving_values: Vec<f64> = survivors.iter().map(|(v, _)| *v).collect();
    let variance = Data::new(surviving_values).variance().unwrap_or(0.0);

    Ok(ResolvedValue {
        value,
        confidence: 1.0 / (1.0 + variance),
        sources_used: survivors.len(),
        outliers_discarded,
        method,
    })
}

fn population_std_dev(values: &[f64]) -> f64 {
    use statrs::statistics::Statistics;
    values.iter().population_std_dev()
}
