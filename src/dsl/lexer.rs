use crate::errors::EngineError;

/// One lexed token plus its byte offset in the query text. Offsets feed
/// parse errors so callers can point at the exact spot.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare word: keyword, symbol, metric name or timeframe literal.
    /// Keyword matching happens in the parser, case-insensitively.
    Ident(String),
    Number(f64),
    Colon,
    Comma,
    LParen,
    RParen,
    /// `->` in MACRO statements.
    Arrow,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Percent,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(s) => format!("'{s}'"),
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Colon => "':'".into(),
            TokenKind::Comma => "','".into(),
            TokenKind::LParen => "'('".into(),
            TokenKind::RParen => "')'".into(),
            TokenKind::Arrow => "'->'".into(),
            TokenKind::Gt => "'>'".into(),
            TokenKind::Lt => "'<'".into(),
            TokenKind::Ge => "'>='".into(),
            TokenKind::Le => "'<='".into(),
            TokenKind::Eq => "'='".into(),
            TokenKind::Percent => "'%'".into(),
            TokenKind::Eof => "end of input".into(),
        }
    }
}

/// Tokenize query text. Never drops input silently: anything
/// unrecognizable is a structured parse error with its position.
pub fn tokenize(input: &str) -> Result<Vec<Token>, EngineError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            ':' => {
                tokens.push(Token { kind: TokenKind::Colon, position: i });
                i += 1;
            }
            ',' => {
                tokens.push(Token { kind: TokenKind::Comma, position: i });
                i += 1;
            }
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, position: i });
                i += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, position: i });
                i += 1;
            }
            '%' => {
                tokens.push(Token { kind: TokenKind::Percent, position: i });
                i += 1;
            }
            '=' => {
                tokens.push(Token { kind: TokenKind::Eq, position: i });
                i += 1;
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Ge, position: i });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, position: i });
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Le, position: i });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Lt, position: i });
                    i += 1;
                }
            }
            '-' => {
                if bytes.get(i + 1) == Some(&b'>') {
                    tokens.push(Token { kind: TokenKind::Arrow, position: i });
                    i += 2;
                } else if bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()) {
                    let (number, next) = lex_number(input, i)?;
                    tokens.push(Token { kind: TokenKind::Number(number), position: i });
                    i = next;
                } else {
                    return Err(EngineError::DslParse {
                        position: i,
                        message: "unexpected '-' (expected '->' or a negative number)".into(),
                    });
                }
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let (number, next) = lex_number(input, i)?;
                // A trailing alphabetic run makes this a timeframe-style
                // ident ("30d", "52w"), not a number.
                if bytes.get(next).is_some_and(|b| b.is_ascii_alphabetic()) {
                    let mut j = next;
                    while j < bytes.len() && (bytes[j] as char).is_ascii_alphanumeric() {
                        j += 1;
                    }
                    tokens.push(Token {
                        kind: TokenKind::Ident(input[start..j].to_string()),
                        position: start,
                    });
                    i = j;
                } else {
                    tokens.push(Token { kind: TokenKind::Number(number), position: start });
                    i = next;
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(input[start..i].to_string()),
                    position: start,
                });
            }
            other => {
                return Err(EngineError::DslParse {
                    position: i,
                    message: format!("unexpected character '{other}'"),
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: input.len(),
    });
    Ok(tokens)
}

fn lex_number(input: &str, start: usize) -> Result<(f64, usize), EngineError> {
    let bytes = input.as_bytes();
    let mut i = start;
    if bytes[i] == b'-' {
        i += 1;
    }
    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.' || bytes[i] == b'_') {
        i += 1;
    }
    let raw: String = input[start..i].chars().filter(|c| *c != '_').collect();
    let value = raw.parse::<f64>().map_err(|_| EngineError::DslParse {
        position: start,
        message: format!("malformed number '{raw}'"),
    })?;
    Ok((value, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_basic_evaluate_tokens() {
        let toks = kinds("EVALUATE TSLA: PRICE, VOLATILITY(30d)");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("EVALUATE".into()),
                TokenKind::Ident("TSLA".into()),
                TokenKind::Colon,
                TokenKind::Ident("PRICE".into()),
                TokenKind::Comma,
                TokenKind::Ident("VOLATILITY".into()),
                TokenKind::LParen,
                TokenKind::Ident("30d".into()),
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_arrow_and_comparators() {
        let toks = kinds("MACRO: CPI -> regime ON SPY WHERE x >= 5%");
        assert!(toks.contains(&TokenKind::Arrow));
        assert!(toks.contains(&TokenKind::Ge));
        assert!(toks.contains(&TokenKind::Percent));
    }

    #[test]
    fn test_numbers_vs_timeframes() {
        let toks = kinds("SCAN crypto WHERE volume > 1000000, change > 30d");
        assert!(toks.contains(&TokenKind::Number(1_000_000.0)));
        assert!(toks.contains(&TokenKind::Ident("30d".into())));
    }

    #[test]
    fn test_unexpected_character_reports_position() {
        let err = tokenize("EVALUATE TSLA; PRICE").unwrap_err();
        match err {
            EngineError::DslParse { position, .. } => assert_eq!(position, 13),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_token_positions() {
        let toks = tokenize("COMPARE AAPL vs MSFT").unwrap();
        assert_eq!(toks[0].position, 0);
        assert_eq!(toks[1].position, 8);
        assert_eq!(toks[2].position, 13);
        assert_eq!(toks[3].position, 16);
    }
}
