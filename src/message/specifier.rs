//! Sub-addressing below an endpoint's routing key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Dot-delimited token sequence, e.g. `"calibration.gain"`.
///
/// For `cmd` requests the first token names the command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Specifier(String);

impl Specifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tokens in order. An empty specifier has no tokens.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split('.').filter(|t| !t.is_empty())
    }

    pub fn first(&self) -> Option<&str> {
        self.tokens().next()
    }

    /// Everything after the first token.
    pub fn rest(&self) -> Specifier {
        match self.0.split_once('.') {
            Some((_, rest)) => Specifier(rest.to_string()),
            None => Specifier::default(),
        }
    }
}

impl From<&str> for Specifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Specifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
