use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// A lookback window like `30d`, `12w`, `6m` or `1y`, normalized to days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    pub days: u32,
}

impl Timeframe {
    /// Parse a timeframe literal. `position` is the literal's offset in
    /// the query text, used for the error on malformed input.
    pub fn parse(raw: &str, position: usize) -> Result<Self, EngineError> {
        let raw = raw.trim();
        let split = raw
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(|| malformed(raw, position))?;
        let (digits, unit) = raw.split_at(split);
        let count: u32 = digits.parse().map_err(|_| malformed(raw, position))?;
        if count == 0 {
            return Err(malformed(raw, position));
        }
        let days = match unit.to_ascii_lowercase().as_str() {
            "d" => count,
            "w" => count * 7,
            "m" => count * 30,
            "y" => count * 365,
            _ => return Err(malformed(raw, position)),
        };
        Ok(Self { days })
    }
}

fn malformed(raw: &str, position: usize) -> EngineError {
    EngineError::DslParse {
        position,
        message: format!("malformed timeframe '{raw}' (expected e.g. 30d, 12w, 6m, 1y)"),
    }
}

/// Argument to a parameterized metric, e.g. the `30d` in VOLATILITY(30d).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricParam {
    Duration(Timeframe),
    Number(f64),
    Symbol(String),
}

/// One requested metric: bare name or name plus parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub params: Vec<MetricParam>,
}

impl Metric {
    pub fn bare(name: &str) -> Self {
        Self {
            name: name.to_uppercase(),
            params: Vec::new(),
        }
    }

    /// First duration parameter, if any.
    pub fn window(&self) -> Option<Timeframe> {
        self.params.iter().find_map(|p| match p {
            MetricParam::Duration(tf) => Some(*tf),
            _ => None,
        })
    }

    /// First numeric parameter, if any.
    pub fn number(&self) -> Option<f64> {
        self.params.iter().find_map(|p| match p {
            MetricParam::Number(n) => Some(*n),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl ConditionOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ConditionOp::Gt => ">",
            ConditionOp::Lt => "<",
            ConditionOp::Ge => ">=",
            ConditionOp::Le => "<=",
            ConditionOp::Eq => "=",
        }
    }

    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            ConditionOp::Gt => left > right,
            ConditionOp::Lt => left < right,
            ConditionOp::Ge => left >= right,
            ConditionOp::Le => left <= right,
            ConditionOp::Eq => (left - right).abs() < f64::EPSILON,
        }
    }
}

/// One SCAN filter: `field op value`, value optionally a percentage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
    pub value: f64,
    pub is_percent: bool,
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}{}",
            self.field,
            self.op.symbol(),
            self.value,
            if self.is_percent { "%" } else { "" }
        )
    }
}

/// A parsed query statement. One query text is exactly one statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "statement", rename_all = "snake_case")]
pub enum Statement {
    Evaluate {
        asset: String,
        metrics: Vec<Metric>,
    },
    Compare {
        assets: Vec<String>,
        metrics: Vec<Metric>,
    },
    Macro {
        indicators: Vec<String>,
        analysis_type: String,
        target: String,
    },
    Correlate {
        asset: String,
        peers: Vec<String>,
        window: Option<Timeframe>,
    },
    Scan {
        market: String,
        conditions: Vec<Condition>,
    },
}
