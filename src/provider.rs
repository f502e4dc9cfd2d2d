use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::models::{Asset, DataRequest, DataType, ProviderResponse, ProviderStats, Region};

/// Contract every upstream data source satisfies. The engine never
/// implements a concrete provider; a registry of these is injected.
///
/// `fetch` errors must be one of the provider variants of [`EngineError`]
/// (`Provider`, `ProviderRateLimit`, `ProviderTimeout`) so arbitration can
/// classify them for fallback and stats purposes.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    /// Whether this source can answer for the given asset and data type.
    /// Checked before scoring; unsupported providers are never candidates.
    fn supports(&self, asset: &Asset, data_type: DataType) -> bool;

    async fn fetch(&self, request: &DataRequest) -> Result<ProviderResponse, EngineError>;

    /// Self-reported health. The engine observes latency, freshness and
    /// reliability itself; uptime and completeness come from here because
    /// only the source knows its own coverage.
    fn health(&self) -> ProviderStats;

    /// Where the provider's endpoint lives. Same-region callers get a
    /// latency preference during scoring.
    fn region(&self) -> Option<Region> {
        None
    }
}

pub type SharedProvider = Arc<dyn Provider>;

/// Injected set of providers. Immutable after construction.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<SharedProvider>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<SharedProvider>) -> Self {
        Self { providers }
    }

    pub fn get(&self, id: &str) -> Option<&SharedProvider> {
        self.providers.iter().find(|p| p.id() == id)
    }

    /// Providers declaring support for this request, in registry order.
    pub fn candidates_for(&self, asset: &Asset, data_type: DataType) -> Vec<SharedProvider> {
        self.providers
            .iter()
            .filter(|p| p.supports(asset, data_type))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> &[SharedProvider] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.providers.iter().map(|p| p.id()).collect();
        f.debug_struct("ProviderRegistry").field("providers", &ids).finish()
    }
}
