//! Feed subscription sources
//!
//! Supports the provider websocket stream and an in-process replay feed.

pub mod alpaca;
pub mod replay;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{RawMessage, SubscriptionScope};

pub use alpaca::AlpacaNewsStream;
pub use replay::{ReplayFeed, ReplayStats};

/// Errors raised while establishing or running a subscription
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    Connect(String),

    /// Provider refused the credentials or the subscription
    #[error("feed rejected credentials: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not connected")]
    NotConnected,

    #[error("already subscribed with scope {0}")]
    AlreadySubscribed(String),
}

impl FeedError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Event delivered to the session by a running subscription
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// One inbound message, not yet validated
    Message(RawMessage),
    /// The transport went away; no further events follow
    Disconnected(String),
}

/// Unified streaming interface
///
/// One provider instance owns one transport connection. `subscribe` may be
/// called once per connection; repeating it with the same scope is a no-op.
#[async_trait]
pub trait StreamProvider: Send {
    /// Connect and authenticate
    async fn connect(&mut self) -> Result<(), FeedError>;

    /// Start delivering messages for `scope` into `tx`
    async fn subscribe(
        &mut self,
        scope: &SubscriptionScope,
        tx: mpsc::Sender<FeedEvent>,
    ) -> Result<(), FeedError>;

    /// Stop delivery and release the connection
    async fn disconnect(&mut self) -> Result<(), FeedError>;
}
