use chrono::{DateTime, Utc};

use crate::config::EvictionPolicyKind;

use super::{CacheEntry, CacheKey};

/// Keys that are never eviction candidates, whatever the policy says.
/// Patterns are exact keys or `prefix*` globs against the display form
/// (e.g. `SPY:*` protects every data type for SPY).
#[derive(Debug, Clone, Default)]
pub struct ProtectedKeys {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl ProtectedKeys {
    pub fn from_patterns(patterns: &[String]) -> Self {
        let mut exact = Vec::new();
        let mut prefixes = Vec::new();
        for p in patterns {
            match p.strip_suffix('*') {
                Some(prefix) => prefixes.push(prefix.to_string()),
                None => exact.push(p.clone()),
            }
        }
        Self { exact, prefixes }
    }

    pub fn is_protected(&self, key: &CacheKey) -> bool {
        let rendered = key.to_string();
        self.exact.iter().any(|e| *e == rendered)
            || self.prefixes.iter().any(|p| rendered.starts_with(p.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

/// Selects the eviction victim among unprotected entries.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    kind: EvictionPolicyKind,
    /// Hybrid only: weight on recency vs frequency, in [0, 1].
    recency_weight: f64,
}

impl EvictionPolicy {
    pub fn new(kind: EvictionPolicyKind, recency_weight: f64) -> Self {
        Self {
            kind,
            recency_weight: recency_weight.clamp(0.0, 1.0),
        }
    }

    /// Pick the victim from `candidates`. Protected keys must already be
    /// filtered out by the caller. Returns `None` on an empty slate.
    ///
    /// Higher eviction score = worse entry = evicted first. Ties break on
    /// the rendered key so repeated runs pick the same victim.
    pub fn select_victim<'a>(
        &self,
        candidates: &[(&'a CacheKey, &CacheEntry)],
        now: DateTime<Utc>,
    ) -> Option<&'a CacheKey> {
        if candidates.is_empty() {
            return None;
        }
        let max_idle = candidates
            .iter()
            .map(|(_, e)| idle_secs(e, now))
            .fold(1.0_f64, f64::max);

        candidates
            .iter()
            .map(|(key, entry)| {
                let score = match self.kind {
                    EvictionPolicyKind::Lru => idle_secs(entry, now),
                    EvictionPolicyKind::Lfu => 1.0 / (1.0 + entry.access_count as f64),
                    EvictionPolicyKind::Hybrid => {
                        let recency = idle_secs(entry, now) / max_idle;
                        let infrequency = 1.0 / (1.0 + entry.access_count as f64);
                        self.recency_weight * recency + (1.0 - self.recency_weight) * infrequency
                    }
                };
                (*key, score)
            })
            .max_by(|(ka, sa), (kb, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| kb.to_string().cmp(&ka.to_string()))
            })
            .map(|(key, _)| key)
    }
}

fn idle_secs(entry: &CacheEntry, now: DateTime<Utc>) -> f64 {
    (now - entry.last_access)
        .to_std()
        .unwrap_or(std::time::Duration::ZERO)
        .as_secs_f64()
}
