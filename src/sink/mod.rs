//! Persistence sinks
//!
//! A sink writes one validated [`NewsEvent`] per call and classifies every
//! failure into a [`PersistError`]. Implementations:
//! - [`postgres::PostgresSink`]: pooled PostgreSQL connections
//! - [`memory::MemorySink`]: in-process store with the same key semantics

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::NewsEvent;

/// Failure classes of a single insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistErrorKind {
    DuplicateKey,
    ConstraintViolation,
    Unavailable,
    Unknown,
}

impl PersistErrorKind {
    /// Label used for metrics and logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateKey => "duplicate_key",
            Self::ConstraintViolation => "constraint_violation",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        }
    }
}

/// Error returned by [`PersistenceSink::persist`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    /// A row with the same key already exists
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Any other data-level rejection (not null, check, foreign key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Datastore unreachable, connection lost or timed out
    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("unknown persistence error: {0}")]
    Unknown(String),
}

impl PersistError {
    pub fn kind(&self) -> PersistErrorKind {
        match self {
            Self::DuplicateKey(_) => PersistErrorKind::DuplicateKey,
            Self::ConstraintViolation(_) => PersistErrorKind::ConstraintViolation,
            Self::Unavailable(_) => PersistErrorKind::Unavailable,
            Self::Unknown(_) => PersistErrorKind::Unknown,
        }
    }

    /// Only transient faults are worth another attempt; data-level
    /// rejections never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Destination for validated events
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Insert one event. The connection or transaction used for the write
    /// is released before this returns, whatever the outcome.
    async fn persist(&self, event: &NewsEvent) -> Result<(), PersistError>;

    /// Release every datastore resource held by the sink.
    async fn close(&self) {}
}
