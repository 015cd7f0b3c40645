//! In-process feed that replays a fixed list of messages.
//!
//! Backs `--dry-run` style tests: connect/subscribe/disconnect calls are
//! counted in [`ReplayStats`] so callers can check subscription behaviour.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{FeedError, FeedEvent, StreamProvider};
use crate::types::{RawMessage, SubscriptionScope};

/// Call counters shared between a [`ReplayFeed`] and the test that built it
#[derive(Debug, Clone, Default)]
pub struct ReplayStats {
    connects: Arc<AtomicUsize>,
    subscriptions: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl ReplayStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Subscribe requests that actually started a delivery
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

pub struct ReplayFeed {
    messages: Vec<RawMessage>,
    hold_open: bool,
    connect_error: Option<FeedError>,
    stats: ReplayStats,
    connected: bool,
    scope: Option<SubscriptionScope>,
    task: Option<JoinHandle<()>>,
}

impl ReplayFeed {
    /// After the last message the feed reports a disconnect.
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages,
            hold_open: false,
            connect_error: None,
            stats: ReplayStats::default(),
            connected: false,
            scope: None,
            task: None,
        }
    }

    /// Keep the subscription open after the last message until disconnected.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// `connect` fails with `error`.
    pub fn failing_connect(mut self, error: FeedError) -> Self {
        self.connect_error = Some(error);
        self
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats.clone()
    }
}

#[async_trait]
impl StreamProvider for ReplayFeed {
    async fn connect(&mut self) -> Result<(), FeedError> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.connect_error {
            return Err(error.clone());
        }
        self.connected = true;
        Ok(())
    }

    async fn subscribe(
        &mut self,
        scope: &SubscriptionScope,
        tx: mpsc::Sender<FeedEvent>,
    ) -> Result<(), FeedError> {
        if let Some(active) = &self.scope {
            if active == scope {
                return Ok(());
            }
            return Err(FeedError::AlreadySubscribed(active.to_string()));
        }
        if !self.connected {
            return Err(FeedError::NotConnected);
        }

        self.stats.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.scope = Some(scope.clone());

        let messages = std::mem::take(&mut self.messages);
        let hold_open = self.hold_open;
        self.task = Some(tokio::spawn(async move {
            for message in messages {
                if tx.send(FeedEvent::Message(message)).await.is_err() {
                    return;
                }
            }
            if hold_open {
                std::future::pending::<()>().await;
            }
            debug!("replay exhausted");
            let _ = tx.send(FeedEvent::Disconnected("replay finished".into())).await;
        }));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), FeedError> {
        self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.connected = false;
        self.scope = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_then_reports_disconnect() {
        let mut feed = ReplayFeed::new(vec!["a".into(), "b".into()]);
        let (tx, mut rx) = mpsc::channel(4);
        feed.connect().await.unwrap();
        feed.subscribe(&SubscriptionScope::All, tx).await.unwrap();

        for expected in ["a", "b"] {
            match rx.recv().await {
                Some(FeedEvent::Message(RawMessage::Text(t))) => assert_eq!(t, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(rx.recv().await, Some(FeedEvent::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_repeated_subscribe_is_idempotent() {
        let mut feed = ReplayFeed::new(vec!["a".into()]).hold_open();
        let stats = feed.stats();
        let (tx, _rx) = mpsc::channel(4);
        feed.connect().await.unwrap();
        feed.subscribe(&SubscriptionScope::All, tx.clone()).await.unwrap();
        feed.subscribe(&SubscriptionScope::All, tx.clone()).await.unwrap();

        assert_eq!(stats.subscriptions(), 1);
        assert_eq!(
            feed.subscribe(&SubscriptionScope::Symbols(vec!["AAPL".into()]), tx)
                .await,
            Err(FeedError::AlreadySubscribed("*".into()))
        );
    }

    #[tokio::test]
    async fn test_failing_connect_is_counted_and_repeated() {
        let mut feed = ReplayFeed::new(Vec::new()).failing_connect(FeedError::Auth("401".into()));
        let stats = feed.stats();
        assert_eq!(feed.connect().await, Err(FeedError::Auth("401".into())));
        assert_eq!(feed.connect().await, Err(FeedError::Auth("401".into())));
        assert_eq!(stats.connects(), 2);

        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(
            feed.subscribe(&SubscriptionScope::All, tx).await,
            Err(FeedError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_fails() {
        let mut feed = ReplayFeed::new(Vec::new());
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(
            feed.subscribe(&SubscriptionScope::All, tx).await,
            Err(FeedError::NotConnected)
        );
    }
}
