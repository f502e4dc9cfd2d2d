use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::config::TtlConfig;
use crate::models::{AssetClass, DataType};

/// Computes the effective TTL for one write: base TTL per data type,
/// shortened while the relevant market is open, lengthened after hours
/// and on weekends, shortened again for high-volatility asset classes.
#[derive(Debug, Clone)]
pub struct TtlCalculator {
    config: TtlConfig,
}

impl TtlCalculator {
    pub fn new(config: TtlConfig) -> Self {
        Self { config }
    }

    pub fn ttl_for(&self, class: AssetClass, data_type: DataType, now: DateTime<Utc>) -> Duration {
        let base = match data_type {
            DataType::Price => self.config.price,
            DataType::Ohlcv => self.config.ohlcv,
            DataType::History => self.config.history,
            DataType::Fundamentals => self.config.fundamentals,
            DataType::News => self.config.news,
            DataType::Sentiment => self.config.sentiment,
        };

        let session_factor = if market_open(class, now) {
            self.config.market_open_factor
        } else {
            self.config.after_hours_factor
        };
        let class_factor = if class.is_high_volatility() {
            self.config.volatile_class_factor
        } else {
            1.0
        };

        let secs = base.as_secs_f64() * session_factor * class_factor;
        Duration::from_secs_f64(secs.max(1.0))
    }
}

/// Coarse UTC session calendar. Crypto never closes; equities and the
/// index/ETF/commodity complex follow the US cash session; forex runs
/// through the week but closes on the weekend.
fn market_open(class: AssetClass, now: DateTime<Utc>) -> bool {
    let weekday = now.weekday();
    let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
    match class {
        AssetClass::Crypto => true,
        AssetClass::Forex => !weekend,
        AssetClass::Equity | AssetClass::Etf | AssetClass::Index | AssetClass::Commodity => {
            if weekend {
                return false;
            }
            // 14:30-21:00 UTC, the US cash session.
            let minute_of_day = now.hour() * 60 + now.minute();
            (14 * 60 + 30..21 * 60).contains(&minute_of_day)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calc() -> TtlCalculator {
        TtlCalculator::new(TtlConfig::default())
    }

    // 2024-01-10 was a Wednesday.
    fn wednesday_session() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 15, 0, 0).unwrap()
    }

    fn saturday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 13, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_equity_ttl_shorter_during_session() {
        let c = calc();
        let open = c.ttl_for(AssetClass::Equity, DataType::Price, wednesday_session());
        let closed = c.ttl_for(AssetClass::Equity, DataType::Price, saturday());
        assert!(open < closed, "open {open:?} should be shorter than weekend {closed:?}");
    }

    #[test]
    fn test_crypto_shorter_than_equity() {
        let c = calc();
        let when = wednesday_session();
        let crypto = c.ttl_for(AssetClass::Crypto, DataType::Price, when);
        let equity = c.ttl_for(AssetClass::Equity, DataType::Price, when);
        assert!(crypto < equity);
    }

    #[test]
    fn test_fundamentals_far_longer_than_price() {
        let c = calc();
        let when = wednesday_session();
        let f = c.ttl_for(AssetClass::Equity, DataType::Fundamentals, when);
        let p = c.ttl_for(AssetClass::Equity, DataType::Price, when);
        assert!(f > p * 10);
    }

    #[test]
    fn test_ttl_never_zero() {
        let mut cfg = TtlConfig::default();
        cfg.price = Duration::from_secs(1);
        cfg.market_open_factor = 0.001;
        cfg.volatile_class_factor = 0.001;
        let c = TtlCalculator::new(cfg);
        let ttl = c.ttl_for(AssetClass::Crypto, DataType::Price, wednesday_session());
        assert!(ttl >= Duration::from_secs(1));
    }
}
