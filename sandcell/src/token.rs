//! Correlation tokens matching a result message to its invocation

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Single-use identifier shared between the supervisor and one execution
/// context. Compared by exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Issues unguessable tokens backed by random v4 UUIDs.
#[derive(Debug, Clone, Default)]
pub struct TokenSource;

impl TokenSource {
    pub fn new() -> Self {
        Self
    }

    pub fn issue(&self) -> CorrelationToken {
        CorrelationToken(Uuid::new_v4().simple().to_string())
    }
}
