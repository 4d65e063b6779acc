//! Topic patterns over dot-delimited routing keys.
//!
//! Matching follows AMQP topic exchanges so that the offline shim and a live
//! broker agree on what a binding receives:
//! - a literal token matches the identical segment (case-sensitive)
//! - `*` matches exactly one segment
//! - `#` matches zero or more segments
//!
//! Wildcards are whole tokens; `sensor*` is a literal.

use std::fmt;
use std::str::FromStr;

use super::RoutingError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Star,
    Hash,
}

/// Parsed routing pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self, RoutingError> {
        if raw.is_empty() {
            return Err(RoutingError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        let tokens = raw
            .split('.')
            .map(|token| match token {
                "" => Err(RoutingError::InvalidPattern {
                    pattern: raw.to_string(),
                    reason: "empty segment".to_string(),
                }),
                "*" => Ok(Token::Star),
                "#" => Ok(Token::Hash),
                literal => Ok(Token::Literal(literal.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains no wildcards.
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let segments: Vec<&str> = routing_key.split('.').collect();
        match_tokens(&self.tokens, &segments)
    }

    /// Ordering key for the most-specific route policy: more literal tokens
    /// first, then fewer `#` tokens.
    pub(crate) fn specificity(&self) -> (usize, std::cmp::Reverse<usize>) {
        let literals = self
            .tokens
            .iter()
            .filter(|t| matches!(t, Token::Literal(_)))
            .count();
        let hashes = self.tokens.iter().filter(|t| **t == Token::Hash).count();
        (literals, std::cmp::Reverse(hashes))
    }
}

fn match_tokens(tokens: &[Token], segments: &[&str]) -> bool {
    match tokens.split_first() {
        None => segments.is_empty(),
        Some((Token::Hash, rest)) => {
            (0..=segments.len()).any(|skip| match_tokens(rest, &segments[skip..]))
        }
        Some((Token::Star, rest)) => !segments.is_empty() && match_tokens(rest, &segments[1..]),
        Some((Token::Literal(literal), rest)) => {
            segments.first() == Some(&literal.as_str()) && match_tokens(rest, &segments[1..])
        }
    }
}

impl FromStr for Pattern {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
