use crate::errors::EngineError;

use super::ast::{Condition, ConditionOp, Metric, MetricParam, Statement, Timeframe};
use super::lexer::{tokenize, Token, TokenKind};

/// Metric names the planner knows how to satisfy. Anything else is an
/// `UnknownMetric` error at parse time, not a runtime surprise.
pub const KNOWN_METRICS: &[&str] = &[
    "PRICE",
    "OHLCV",
    "VOLUME",
    "VOLATILITY",
    "SMA",
    "RSI",
    "CHANGE",
    "SENTIMENT",
    "NEWS",
    "PE_RATIO",
    "MARKET_CAP",
    "EPS",
];

/// Parse one query statement. Performs no I/O.
pub fn parse(input: &str) -> Result<Statement, EngineError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let statement = parser.statement()?;
    parser.expect_eof()?;
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::DslParse {
            position: self.peek().position,
            message: message.into(),
        }
    }

    /// Consume an ident matching `word` case-insensitively.
    fn keyword(&mut self, word: &str) -> Result<(), EngineError> {
        match &self.peek().kind {
            TokenKind::Ident(s) if s.eq_ignore_ascii_case(word) => {
                self.advance();
                Ok(())
            }
            other => Err(self.error(format!("expected '{word}', found {}", other.describe()))),
        }
    }

    fn peek_keyword(&self, word: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case(word))
    }

    fn ident(&mut self, what: &str) -> Result<(String, usize), EngineError> {
        match self.peek().kind.clone() {
            TokenKind::Ident(s) => {
                let position = self.peek().position;
                self.advance();
                Ok((s, position))
            }
            other => Err(self.error(format!("expected {what}, found {}", other.describe()))),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), EngineError> {
        if self.peek().kind == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!(
                "expected {}, found {}",
                kind.describe(),
                self.peek().kind.describe()
            )))
        }
    }

    fn expect_eof(&mut self) -> Result<(), EngineError> {
        if self.peek().kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(self.error(format!(
                "unexpected trailing input: {}",
                self.peek().kind.describe()
            )))
        }
    }

    fn statement(&mut self) -> Result<Statement, EngineError> {
        match &self.peek().kind {
            TokenKind::Ident(word) => match word.to_ascii_uppercase().as_str() {
                "EVALUATE" => self.evaluate(),
                "COMPARE" => self.compare(),
                "MACRO" => self.macro_statement(),
                "CORRELATE" => self.correlate(),
                "SCAN" => self.scan(),
                other => Err(self.error(format!(
                    "unknown statement '{other}' (expected EVALUATE, COMPARE, MACRO, CORRELATE or SCAN)"
                ))),
            },
            other => Err(self.error(format!("expected a statement, found {}", other.describe()))),
        }
    }

    // EVALUATE asset ":" metric_list
    fn evaluate(&mut self) -> Result<Statement, EngineError> {
        self.keyword("EVALUATE")?;
        let (asset, _) = self.ident("an asset symbol")?;
        self.expect(TokenKind::Colon)?;
        let metrics = self.metric_list()?;
        Ok(Statement::Evaluate {
            asset: asset.to_uppercase(),
            metrics,
        })
    }

    // COMPARE asset ("vs" asset)+ "ON:" metric_list
    fn compare(&mut self) -> Result<Statement, EngineError> {
        self.keyword("COMPARE")?;
        let (first, _) = self.ident("an asset symbol")?;
        let mut assets = vec![first.to_uppercase()];
        while self.peek_keyword("vs") {
            self.advance();
            let (next, _) = self.ident("an asset symbol")?;
            assets.push(next.to_uppercase());
        }
        if assets.len() < 2 {
            return Err(self.error("COMPARE needs at least two assets joined by 'vs'"));
        }
        self.keyword("ON")?;
        self.expect(TokenKind::Colon)?;
        let metrics = self.metric_list()?;
        Ok(Statement::Compare { assets, metrics })
    }

    // "MACRO:" indicator_list "->" analysis_type "ON" asset
    fn macro_statement(&mut self) -> Result<Statement, EngineError> {
        self.keyword("MACRO")?;
        self.expect(TokenKind::Colon)?;
        let mut indicators = Vec::new();
        loop {
            let (indicator, _) = self.ident("a macro indicator name")?;
            indicators.push(indicator.to_uppercase());
            if self.peek().kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::Arrow)?;
        let (analysis_type, _) = self.ident("an analysis type")?;
        self.keyword("ON")?;
        let (target, _) = self.ident("a target asset")?;
        Ok(Statement::Macro {
            indicators,
            analysis_type: analysis_type.to_lowercase(),
            target: target.to_uppercase(),
        })
    }

    // CORRELATE asset "WITH" asset_list ["WINDOW" timeframe]
    fn correlate(&mut self) -> Result<Statement, EngineError> {
        self.keyword("CORRELATE")?;
        let (asset, _) = self.ident("an asset symbol")?;
        self.keyword("WITH")?;
        let mut peers = Vec::new();
        loop {
            let (peer, _) = self.ident("a peer symbol")?;
            peers.push(peer.to_uppercase());
            if self.peek().kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        let window = if self.peek_keyword("WINDOW") {
            self.advance();
            let (raw, position) = self.ident("a timeframe like 90d")?;
            Some(Timeframe::parse(&raw, position)?)
        } else {
            None
        };
        Ok(Statement::Correlate {
            asset: asset.to_uppercase(),
            peers,
            window,
        })
    }

    // SCAN market "WHERE" condition_list
    fn scan(&mut self) -> Result<Statement, EngineError> {
        self.keyword("SCAN")?;
        let (market, _) = self.ident("a market name")?;
        self.keyword("WHERE")?;
        let mut conditions = Vec::new();
        loop {
            conditions.push(self.condition()?);
            if self.peek().kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        Ok(Statement::Scan {
            market: market.to_lowercase(),
            conditions,
        })
    }

    fn condition(&mut self) -> Result<Condition, EngineError> {
        let (field, _) = self.ident("a condition field")?;
        let op = match self.peek().kind {
            TokenKind::Gt => ConditionOp::Gt,
            TokenKind::Lt => ConditionOp::Lt,
            TokenKind::Ge => ConditionOp::Ge,
            TokenKind::Le => ConditionOp::Le,
            TokenKind::Eq => ConditionOp::Eq,
            ref other => {
                return Err(self.error(format!(
                    "expected a comparison operator, found {}",
                    other.describe()
                )))
            }
        };
        self.advance();
        let value = match self.peek().kind {
            TokenKind::Number(n) => {
                self.advance();
                n
            }
            ref other => {
                return Err(self.error(format!("expected a number, found {}", other.describe())))
            }
        };
        let is_percent = if self.peek().kind == TokenKind::Percent {
            self.advance();
            true
        } else {
            false
        };
        Ok(Condition {
            field: field.to_lowercase(),
            op,
            value,
            is_percent,
        })
    }

    fn metric_list(&mut self) -> Result<Vec<Metric>, EngineError> {
        let mut metrics = Vec::new();
        loop {
            metrics.push(self.metric()?);
            if self.peek().kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        Ok(metrics)
    }

    // metric := NAME | NAME "(" param ("," param)* ")"
    fn metric(&mut self) -> Result<Metric, EngineError> {
        let (raw_name, position) = self.ident("a metric name")?;
        let name = raw_name.to_uppercase();
        if !KNOWN_METRICS.contains(&name.as_str()) {
            return Err(EngineError::UnknownMetric { name, position });
        }

        let mut params = Vec::new();
        if self.peek().kind == TokenKind::LParen {
            self.advance();
            loop {
                params.push(self.metric_param()?);
                match self.peek().kind {
                    TokenKind::Comma => {
                        self.advance();
                    }
                    TokenKind::RParen => break,
                    ref other => {
                        return Err(self.error(format!(
                            "expected ',' or ')', found {}",
                            other.describe()
                        )))
                    }
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        Ok(Metric { name, params })
    }

    fn metric_param(&mut self) -> Result<MetricParam, EngineError> {
        match self.peek().kind.clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(MetricParam::Number(n))
            }
            TokenKind::Ident(s) => {
                let position = self.peek().position;
                self.advance();
                // Timeframe literals start with a digit; plain words are
                // symbol parameters.
                if s.starts_with(|c: char| c.is_ascii_digit()) {
                    Ok(MetricParam::Duration(Timeframe::parse(&s, position)?))
                } else {
                    Ok(MetricParam::Symbol(s.to_uppercase()))
                }
            }
            other => Err(self.error(format!(
                "expected a metric parameter, found {}",
                other.describe()
            ))),
        }
    }
}
