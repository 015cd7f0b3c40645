//! Structured logging for the ingest pipeline

use std::fmt;

use uuid::Uuid;

use crate::sink::PersistError;
use crate::validator::RejectReason;

/// Identifies one subscription session in every log line it produces
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Structured logger for per-event outcomes
#[derive(Debug, Clone, Default)]
pub struct EventLogger {
    correlation_id: CorrelationId,
}

impl EventLogger {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self { correlation_id }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn received(&self, sequence: u64, event_id: Option<i64>) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            sequence,
            event_id,
            "Message received"
        );
    }

    pub fn persisted(&self, event_id: i64, headline: &str, latency_ms: u64) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            event_id,
            headline = %headline,
            latency_ms,
            "News event stored"
        );
    }

    pub fn rejected(&self, reason: &RejectReason) {
        tracing::warn!(
            correlation_id = %self.correlation_id,
            reason = %reason,
            "Message rejected"
        );
    }

    pub fn dropped(&self, event_id: i64, error: &PersistError) {
        tracing::warn!(
            correlation_id = %self.correlation_id,
            event_id,
            kind = error.kind().as_str(),
            error = %error,
            "News event dropped"
        );
    }

    pub fn stored_by_earlier_attempt(&self, event_id: i64, attempt: u32) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            event_id,
            attempt,
            "Duplicate key on retry, earlier attempt was committed"
        );
    }

    pub fn retrying(&self, event_id: i64, attempt: u32) {
        tracing::debug!(
            correlation_id = %self.correlation_id,
            event_id,
            attempt,
            "Retrying insert after datastore was unavailable"
        );
    }
}
