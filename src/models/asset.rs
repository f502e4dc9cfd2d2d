use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Asset class tag. Drives dynamic TTL and provider support checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    Equity,
    Crypto,
    Forex,
    Commodity,
    Index,
    Etf,
}

impl AssetClass {
    /// Classes whose prices move fast enough to warrant shorter TTLs.
    pub fn is_high_volatility(&self) -> bool {
        matches!(self, AssetClass::Crypto | AssetClass::Forex)
    }
}

/// An instrument identity. Immutable value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub class: AssetClass,
    /// Exchange / market identifier, e.g. "NASDAQ", "BINANCE".
    pub market: String,
    pub currency: String,
}

impl Asset {
    pub fn new(symbol: &str, class: AssetClass, market: &str, currency: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            class,
            market: market.to_string(),
            currency: currency.to_string(),
        }
    }

    /// Shorthand for a US equity, the most common case in tests and demos.
    pub fn equity(symbol: &str) -> Self {
        Self::new(symbol, AssetClass::Equity, "NASDAQ", "USD")
    }

    pub fn crypto(symbol: &str) -> Self {
        Self::new(symbol, AssetClass::Crypto, "BINANCE", "USD")
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.market, self.symbol)
    }
}

/// What kind of data a request is after. Closed set: merge strategies and
/// TTL rules are matched exhaustively against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Price,
    Ohlcv,
    /// Historical price series (used by derived metrics).
    History,
    Fundamentals,
    News,
    Sentiment,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Price => "price",
            DataType::Ohlcv => "ohlcv",
            DataType::History => "history",
            DataType::Fundamentals => "fundamentals",
            DataType::News => "news",
            DataType::Sentiment => "sentiment",
        }
    }

    /// Data used for audit must reach L2 before the write returns.
    pub fn requires_durable_write(&self) -> bool {
        matches!(self, DataType::Fundamentals)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller region, used for latency preference when ordering providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    UsEast,
    UsWest,
    Europe,
    Asia,
}

/// Freshness and locality requirements attached to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    /// Oldest acceptable data age. Also bounds cache hits.
    pub max_staleness: Duration,
    /// Caller region, if known. Same-region providers get a latency bonus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            max_staleness: Duration::from_secs(300),
            region: None,
        }
    }
}

/// One request for one piece of data. Created and discarded per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub asset: Asset,
    pub data_type: DataType,
    pub requirements: Requirements,
    /// Extra discriminator, e.g. history window ("90d") or news topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
}

impl DataRequest {
    pub fn new(asset: Asset, data_type: DataType) -> Self {
        Self {
            asset,
            data_type,
            requirements: Requirements::default(),
            qualifier: None,
        }
    }

    pub fn with_qualifier(mut self, qualifier: &str) -> Self {
        self.qualifier = Some(qualifier.to_string());
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.requirements.max_staleness = max_staleness;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_symbol_uppercased() {
        let a = Asset::equity("tsla");
        assert_eq!(a.symbol, "TSLA");
        assert_eq!(a.to_string(), "NASDAQ:TSLA");
    }

    #[test]
    fn test_volatility_classes() {
        assert!(AssetClass::Crypto.is_high_volatility());
        assert!(!AssetClass::Equity.is_high_volatility());
    }
}
