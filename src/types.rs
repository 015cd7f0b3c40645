//! Common types used throughout the ingest pipeline

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated news item, ready to be persisted.
///
/// Instances are only produced by [`crate::validator::validate`] and are
/// never mutated afterwards; the sink either records one or rejects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsEvent {
    /// Provider-assigned identifier (not guaranteed unique across reconnects)
    pub id: i64,

    /// Headline, never empty
    pub headline: String,

    pub summary: String,

    pub author: String,

    pub content: String,

    /// Ticker symbols in the order the provider sent them
    pub symbols: Vec<String>,

    /// Originating news source (e.g. "benzinga")
    pub source: String,

    pub url: String,

    pub created_at: DateTime<Utc>,

    /// Always >= `created_at`
    pub updated_at: DateTime<Utc>,
}

/// Untrusted inbound message as handed over by the feed transport
#[derive(Debug, Clone)]
pub enum RawMessage {
    /// Already decoded JSON element
    Structured(serde_json::Value),
    /// Text payload that still needs decoding
    Text(String),
    /// Binary payload that still needs decoding
    Binary(Bytes),
}

impl RawMessage {
    /// Provider id of a decoded element, for log correlation before
    /// validation. Undecoded payloads report `None`.
    pub fn event_id(&self) -> Option<i64> {
        match self {
            Self::Structured(value) => value.get("id").and_then(serde_json::Value::as_i64),
            Self::Text(_) | Self::Binary(_) => None,
        }
    }
}

impl From<serde_json::Value> for RawMessage {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

impl From<String> for RawMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for RawMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Which symbols a feed subscription covers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionScope {
    /// Single wildcard subscription ("*")
    All,
    /// Explicit symbol list
    Symbols(Vec<String>),
}

impl SubscriptionScope {
    /// Symbols as sent on the wire
    pub fn wire_symbols(&self) -> Vec<String> {
        match self {
            Self::All => vec!["*".to_string()],
            Self::Symbols(symbols) => symbols.clone(),
        }
    }
}

impl fmt::Display for SubscriptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Symbols(symbols) => write!(f, "{}", symbols.join(",")),
        }
    }
}
