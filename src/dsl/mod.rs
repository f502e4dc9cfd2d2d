//! Query language front end.
//!
//! Queries arrive as single-line statements such as
//! `EVALUATE TSLA: PRICE, VOLATILITY(30d)` and are compiled into a
//! [`Statement`] AST. The lexer tracks byte positions so parse errors
//! point at the offending token; metric names are validated here rather
//! than failing later during planning.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{Condition, ConditionOp, Metric, MetricParam, Statement, Timeframe};
pub use parser::{parse, KNOWN_METRICS};

use crate::errors::EngineError;

/// Compile raw query text into an executable statement.
pub fn compile(input: &str) -> Result<Statement, EngineError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(EngineError::DslParse {
            position: 0,
            message: "empty query".to_string(),
        });
    }
    parser::parse(trimmed)
}
