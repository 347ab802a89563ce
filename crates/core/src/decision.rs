//! Decisions: the categorical outcome of one node execution.
//!
//! Superego nodes produce a closed set of four values. Inner agents produce
//! an open, validated token whose meaning is whatever their transition table
//! says it is.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The outcome of a constitution evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuperegoDecision {
    /// Conversation-ending refusal
    Block,
    /// Proceed normally
    Accept,
    /// Proceed, with a caveat carried in the guidance
    Caution,
    /// Ask again; usually routed back to the same node
    NeedsClarification,
}

impl SuperegoDecision {
    pub const ALL: [SuperegoDecision; 4] = [
        SuperegoDecision::Block,
        SuperegoDecision::Accept,
        SuperegoDecision::Caution,
        SuperegoDecision::NeedsClarification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuperegoDecision::Block => "BLOCK",
            SuperegoDecision::Accept => "ACCEPT",
            SuperegoDecision::Caution => "CAUTION",
            SuperegoDecision::NeedsClarification => "NEEDS_CLARIFICATION",
        }
    }
}

impl fmt::Display for SuperegoDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when text is not a usable decision token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid decision token: '{0}'")]
pub struct InvalidDecision(pub String);

/// Upper-cases and joins words with underscores: "needs clarification" -> "NEEDS_CLARIFICATION".
fn normalize_token(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

impl FromStr for SuperegoDecision {
    type Err = InvalidDecision;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = normalize_token(s);
        SuperegoDecision::ALL
            .into_iter()
            .find(|d| d.as_str() == token)
            .ok_or_else(|| InvalidDecision(s.to_string()))
    }
}

/// An open-set Inner Agent decision such as `COMPLETE` or `NEEDS_TOOL`.
///
/// Always non-empty and made of `A-Z`, `0-9` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentDecision(String);

impl AgentDecision {
    pub const COMPLETE: &'static str = "COMPLETE";
    pub const ERROR: &'static str = "ERROR";

    pub fn parse(raw: &str) -> Result<Self, InvalidDecision> {
        let token = normalize_token(raw);
        let valid = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if valid {
            Ok(Self(token))
        } else {
            Err(InvalidDecision(raw.to_string()))
        }
    }

    pub fn complete() -> Self {
        Self(Self::COMPLETE.to_string())
    }

    pub fn error() -> Self {
        Self(Self::ERROR.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_error(&self) -> bool {
        self.0 == Self::ERROR
    }
}

impl TryFrom<String> for AgentDecision {
    type Error = InvalidDecision;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AgentDecision::parse(&value)
    }
}

impl From<AgentDecision> for String {
    fn from(value: AgentDecision) -> Self {
        value.0
    }
}

impl FromStr for AgentDecision {
    type Err = InvalidDecision;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentDecision::parse(s)
    }
}

impl fmt::Display for AgentDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decision recorded on a Step, typed by the kind of node that made it.
///
/// Serialized as the bare token. On the way back in, the four superego
/// values are read as [`SuperegoDecision`], anything else as [`AgentDecision`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Decision {
    Superego(SuperegoDecision),
    Agent(AgentDecision),
}

impl Decision {
    pub fn as_str(&self) -> &str {
        match self {
            Decision::Superego(d) => d.as_str(),
            Decision::Agent(d) => d.as_str(),
        }
    }

    /// `BLOCK` from either node kind.
    pub fn is_block(&self) -> bool {
        self.as_str() == SuperegoDecision::Block.as_str()
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SuperegoDecision> for Decision {
    fn from(value: SuperegoDecision) -> Self {
        Decision::Superego(value)
    }
}

impl From<AgentDecision> for Decision {
    fn from(value: AgentDecision) -> Self {
        Decision::Agent(value)
    }
}
