use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use crate::dsl::ast::{Metric, Statement, Timeframe};
use crate::errors::EngineError;
use crate::models::{
    Asset, AssetClass, ComputeOp, DataRequest, DataType, ExecutionPlan, ExecutionStep, StepId,
};

// Rough per-step costs for the plan's duration estimate. Fetch steps in
// one wave run concurrently, so the estimate charges one fetch round per
// dependency level rather than per step.
const FETCH_COST: Duration = Duration::from_millis(300);
const COMPUTE_COST: Duration = Duration::from_millis(25);
const AGGREGATE_COST: Duration = Duration::from_millis(5);

const DEFAULT_VOLATILITY_DAYS: u32 = 30;
const DEFAULT_CORRELATION_DAYS: u32 = 90;
const DEFAULT_SMA_PERIOD: usize = 20;
const DEFAULT_RSI_PERIOD: usize = 14;
const DEFAULT_CHANGE_DAYS: u32 = 1;

// TODO: replace with a reference-data lookup once an instrument master
// is wired in.
const CRYPTO_SYMBOLS: &[&str] = &["BTC", "ETH", "SOL", "XRP", "ADA", "DOGE", "DOT", "AVAX"];

pub(crate) fn asset_for(symbol: &str) -> Asset {
    if CRYPTO_SYMBOLS.contains(&symbol) {
        Asset::crypto(symbol)
    } else {
        Asset::equity(symbol)
    }
}

/// Lower a parsed statement into a dependency-ordered execution plan.
///
/// Every plan ends in one `aggregate` step that depends on all terminal
/// outputs, so executors have a single completion point to watch.
pub fn plan(statement: &Statement) -> Result<ExecutionPlan, EngineError> {
    let mut builder = PlanBuilder::default();

    match statement {
        Statement::Evaluate { asset, metrics } => {
            for metric in metrics {
                builder.metric_steps(asset, metric)?;
            }
        }
        Statement::Compare { assets, metrics } => {
            for asset in assets {
                for metric in metrics {
                    builder.metric_steps(asset, metric)?;
                }
            }
        }
        Statement::Macro {
            indicators,
            analysis_type,
            target,
        } => builder.macro_steps(indicators, analysis_type, target),
        Statement::Correlate {
            asset,
            peers,
            window,
        } => builder.correlate_steps(asset, peers, *window),
        Statement::Scan { market, conditions } => builder.scan_steps(market, conditions.clone()),
    }

    builder.finish()
}

#[derive(Default)]
struct PlanBuilder {
    steps: Vec<ExecutionStep>,
    has_compute: bool,
}

impl PlanBuilder {
    /// Add a step unless one with the same id already exists. Shared
    /// fetches (two fundamentals metrics, the same history window twice)
    /// collapse into a single node.
    fn push(&mut self, step: ExecutionStep) -> StepId {
        let id = step.id.clone();
        if !self.steps.iter().any(|s| s.id == id) {
            self.steps.push(step);
        }
        id
    }

    fn fetch_history(&mut self, symbol: &str, days: u32) -> StepId {
        let qualifier = format!("{days}d");
        let id = format!("fetch_{}_history_{qualifier}", symbol.to_lowercase());
        let request =
            DataRequest::new(asset_for(symbol), DataType::History).with_qualifier(&qualifier);
        self.push(ExecutionStep::fetch(&id, request))
    }

    fn fetch_simple(&mut self, symbol: &str, data_type: DataType) -> StepId {
        let id = format!("fetch_{}_{data_type}", symbol.to_lowercase());
        let request = DataRequest::new(asset_for(symbol), data_type);
        self.push(ExecutionStep::fetch(&id, request))
    }

    fn compute(&mut self, id: String, op: ComputeOp, deps: Vec<StepId>) -> StepId {
        self.has_compute = true;
        self.push(ExecutionStep::compute(&id, op, deps))
    }

    fn metric_steps(&mut self, symbol: &str, metric: &Metric) -> Result<(), EngineError> {
        let sym = symbol.to_lowercase();
        match metric.name.as_str() {
            "PRICE" => {
                self.fetch_simple(symbol, DataType::Price);
            }
            "OHLCV" | "VOLUME" => {
                self.fetch_simple(symbol, DataType::Ohlcv);
            }
            "SENTIMENT" => {
                self.fetch_simple(symbol, DataType::Sentiment);
            }
            "NEWS" => {
                self.fetch_simple(symbol, DataType::News);
            }
            "PE_RATIO" | "MARKET_CAP" | "EPS" => {
                self.fetch_simple(symbol, DataType::Fundamentals);
            }
            "VOLATILITY" => {
                let days = metric.window().map_or(DEFAULT_VOLATILITY_DAYS, |w| w.days);
                let history = self.fetch_history(symbol, days);
                self.compute(
                    format!("volatility_{sym}_{days}d"),
                    ComputeOp::Volatility { window_days: days },
                    vec![history],
                );
            }
            "SMA" => {
                let period = metric
                    .number()
                    .map(|n| n as usize)
                    .or_else(|| metric.window().map(|w| w.days as usize))
                    .unwrap_or(DEFAULT_SMA_PERIOD);
                let history = self.fetch_history(symbol, (period as u32).max(1) * 2);
                self.compute(
                    format!("sma_{sym}_{period}"),
                    ComputeOp::Sma { period },
                    vec![history],
                );
            }
            "RSI" => {
                let period = metric
                    .number()
                    .map(|n| n as usize)
                    .or_else(|| metric.window().map(|w| w.days as usize))
                    .unwrap_or(DEFAULT_RSI_PERIOD);
                let history = self.fetch_history(symbol, (period as u32).max(1) * 2);
                self.compute(
                    format!("rsi_{sym}_{period}"),
                    ComputeOp::Rsi { period },
                    vec![history],
                );
            }
            "CHANGE" => {
                let days = metric.window().map_or(DEFAULT_CHANGE_DAYS, |w| w.days);
                let history = self.fetch_history(symbol, days.max(2));
                self.compute(
                    format!("change_{sym}_{days}d"),
                    ComputeOp::Change { window_days: days },
                    vec![history],
                );
            }
            other => {
                // The parser validates names, so this only fires for plans
                // built programmatically.
                return Err(EngineError::UnknownMetric {
                    name: other.to_string(),
                    position: 0,
                });
            }
        }
        Ok(())
    }

    fn correlate_steps(&mut self, asset: &str, peers: &[String], window: Option<Timeframe>) {
        let days = window.map_or(DEFAULT_CORRELATION_DAYS, |w| w.days);
        let base = self.fetch_history(asset, days);
        for peer in peers {
            let peer_fetch = self.fetch_history(peer, days);
            self.compute(
                format!("corr_{}_{}", asset.to_lowercase(), peer.to_lowercase()),
                ComputeOp::Correlation,
                vec![base.clone(), peer_fetch],
            );
        }
    }

    fn scan_steps(&mut self, market: &str, conditions: Vec<crate::dsl::ast::Condition>) {
        let id = format!("fetch_{market}_universe");
        let asset = Asset::new(
            &market.to_uppercase(),
            if market.eq_ignore_ascii_case("crypto") {
                AssetClass::Crypto
            } else {
                AssetClass::Index
            },
            &market.to_uppercase(),
            "USD",
        );
        let request = DataRequest::new(asset, DataType::Ohlcv).with_qualifier("universe");
        let universe = self.push(ExecutionStep::fetch(&id, request));
        self.compute(
            format!("filter_{market}"),
            ComputeOp::Filter { conditions },
            vec![universe],
        );
    }

    fn macro_steps(&mut self, indicators: &[String], analysis_type: &str, target: &str) {
        let mut deps = Vec::new();
        for indicator in indicators {
            let id = format!("fetch_macro_{}", indicator.to_lowercase());
            let asset = Asset::new(indicator, AssetClass::Index, "MACRO", "USD");
            let request =
                DataRequest::new(asset, DataType::History).with_qualifier("365d");
            deps.push(self.push(ExecutionStep::fetch(&id, request)));
        }
        deps.push(self.fetch_simple(target, DataType::Price));
        self.compute(
            format!("macro_{analysis_type}"),
            ComputeOp::MacroAnalysis {
                analysis_type: analysis_type.to_string(),
            },
            deps,
        );
    }

    fn finish(mut self) -> Result<ExecutionPlan, EngineError> {
        // Terminal outputs are steps nothing else consumes.
        let consumed: HashSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
            .collect();
        let leaves: Vec<StepId> = self
            .steps
            .iter()
            .filter(|s| !consumed.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect();
        self.steps.push(ExecutionStep::aggregate("aggregate", leaves));

        let mut estimate = FETCH_COST + AGGREGATE_COST;
        if self.has_compute {
            estimate += COMPUTE_COST;
        }
        debug!(steps = self.steps.len(), ?estimate, "plan built");
        ExecutionPlan::new(self.steps, estimate)
    }
}
