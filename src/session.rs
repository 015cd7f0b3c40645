//! Subscription session: one feed connection feeding the validate/persist
//! pipeline until the transport drops or the operator interrupts.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::metrics::{metrics, Timer};
use crate::sink::{PersistError, PersistenceSink};
use crate::state::{SessionState, StateHandle};
use crate::streaming::{FeedError, FeedEvent, StreamProvider};
use crate::structured_logging::{CorrelationId, EventLogger};
use crate::types::{NewsEvent, RawMessage, SubscriptionScope};
use crate::validator::{validate, RejectReason};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub channel_capacity: usize,
    pub drain_grace: Duration,
    pub persist_retry_attempts: u32,
    pub persist_retry_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            channel_capacity: config.channel_capacity.max(1),
            drain_grace: config.drain_grace(),
            persist_retry_attempts: config.persist_retry_attempts,
            persist_retry_delay: config.persist_retry_delay(),
        }
    }
}

/// Result of running one message through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Persisted { id: i64 },
    Rejected(RejectReason),
    Dropped { id: i64, error: PersistError },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub received: u64,
    pub persisted: u64,
    pub rejected: u64,
    pub dropped: u64,
}

impl SessionStats {
    pub fn record(&mut self, outcome: &EventOutcome) {
        match outcome {
            EventOutcome::Persisted { .. } => self.persisted += 1,
            EventOutcome::Rejected(_) => self.rejected += 1,
            EventOutcome::Dropped { .. } => self.dropped += 1,
        }
    }

    pub fn merge(&mut self, other: &SessionStats) {
        self.received += other.received;
        self.persisted += other.persisted;
        self.rejected += other.rejected;
        self.dropped += other.dropped;
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// Operator interrupt; `abandoned_in_flight` is set when the grace
    /// period ran out before the in-flight event finished.
    Interrupted {
        stats: SessionStats,
        abandoned_in_flight: bool,
    },
    TransportLost { reason: String, stats: SessionStats },
    /// Connect or subscribe failed before streaming started
    ConnectFailed(FeedError),
}

/// Per-event validate then persist path
///
/// Every failure is converted into an [`EventOutcome`]; nothing escapes
/// `handle`, including panics raised by the sink.
pub struct EventPipeline {
    sink: Arc<dyn PersistenceSink>,
    retry_attempts: u32,
    retry_delay: Duration,
    logger: EventLogger,
}

impl EventPipeline {
    pub fn new(
        sink: Arc<dyn PersistenceSink>,
        settings: &SessionSettings,
        logger: EventLogger,
    ) -> Self {
        Self {
            sink,
            retry_attempts: settings.persist_retry_attempts,
            retry_delay: settings.persist_retry_delay,
            logger,
        }
    }

    pub fn logger(&self) -> &EventLogger {
        &self.logger
    }

    pub async fn handle(&self, raw: RawMessage) -> EventOutcome {
        let metrics = metrics();
        metrics.messages_received.inc();
        metrics.in_flight.inc();
        let _in_flight = scopeguard::guard((), |_| metrics.in_flight.dec());

        let event = match validate(&raw) {
            Ok(event) => event,
            Err(reason) => {
                metrics.events_rejected.inc();
                self.logger.rejected(&reason);
                return EventOutcome::Rejected(reason);
            }
        };

        let timer = Timer::new();
        match self.persist(&event).await {
            Ok(()) => {
                metrics.events_persisted.inc();
                self.logger
                    .persisted(event.id, &event.headline, (timer.elapsed_secs() * 1000.0) as u64);
                EventOutcome::Persisted { id: event.id }
            }
            Err(error) => {
                metrics
                    .events_dropped
                    .with_label_values(&[error.kind().as_str()])
                    .inc();
                self.logger.dropped(event.id, &error);
                EventOutcome::Dropped {
                    id: event.id,
                    error,
                }
            }
        }
    }

    async fn persist(&self, event: &NewsEvent) -> Result<(), PersistError> {
        let attempts = AtomicU32::new(0);
        let strategy = FixedInterval::new(self.retry_delay).take(self.retry_attempts as usize);

        let sink = &*self.sink;
        let logger = &self.logger;
        let attempts = &attempts;
        let action = move || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempt > 1 {
                metrics().persist_retries.inc();
                logger.retrying(event.id, attempt);
            }
            sink.persist(event)
        };

        let insert = RetryIf::start(strategy, action, PersistError::is_retryable);
        let result = match AssertUnwindSafe(insert).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(PersistError::Unknown(format!(
                "sink panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        // A retry that hits the key means an earlier attempt committed
        // after its outcome was lost.
        let attempt = attempts.load(Ordering::Relaxed);
        match result {
            Err(PersistError::DuplicateKey(_)) if attempt > 1 => {
                self.logger.stored_by_earlier_attempt(event.id, attempt);
                Ok(())
            }
            other => other,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Owns the feed connection for the lifetime of one subscription
pub struct SubscriptionSession {
    feed: Box<dyn StreamProvider>,
    pipeline: EventPipeline,
    state: StateHandle,
    settings: SessionSettings,
}

impl SubscriptionSession {
    pub fn new(
        feed: Box<dyn StreamProvider>,
        sink: Arc<dyn PersistenceSink>,
        state: StateHandle,
        settings: SessionSettings,
    ) -> Self {
        let logger = EventLogger::new(CorrelationId::new());
        let pipeline = EventPipeline::new(sink, &settings, logger);
        Self {
            feed,
            pipeline,
            state,
            settings,
        }
    }

    /// Connect, subscribe to every symbol and process messages in arrival
    /// order until `shutdown` resolves or the transport drops.
    pub async fn run<S>(self, shutdown: &mut S) -> SessionEnd
    where
        S: Future<Output = ()> + Unpin,
    {
        let Self {
            mut feed,
            pipeline,
            state,
            settings,
        } = self;
        let correlation_id = pipeline.logger().correlation_id().clone();
        let mut stats = SessionStats::default();

        let connected = tokio::select! {
            biased;
            _ = &mut *shutdown => None,
            result = feed.connect() => Some(result),
        };
        match connected {
            None => {
                state.set(SessionState::Draining);
                let _ = feed.disconnect().await;
                return SessionEnd::Interrupted {
                    stats,
                    abandoned_in_flight: false,
                };
            }
            Some(Err(e)) => {
                let _ = feed.disconnect().await;
                return SessionEnd::ConnectFailed(e);
            }
            Some(Ok(())) => {}
        }

        let (tx, mut rx) = mpsc::channel(settings.channel_capacity);
        if let Err(e) = feed.subscribe(&SubscriptionScope::All, tx).await {
            let _ = feed.disconnect().await;
            return SessionEnd::ConnectFailed(e);
        }
        state.set(SessionState::Streaming);
        info!(correlation_id = %correlation_id, "Streaming news updates");

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = &mut *shutdown => None,
                event = rx.recv() => Some(event),
            };

            let raw = match next {
                None => {
                    state.set(SessionState::Draining);
                    info!(correlation_id = %correlation_id, "Interrupt received, stopping");
                    break SessionEnd::Interrupted {
                        stats,
                        abandoned_in_flight: false,
                    };
                }
                Some(Some(FeedEvent::Message(raw))) => raw,
                Some(Some(FeedEvent::Disconnected(reason))) => {
                    break SessionEnd::TransportLost { reason, stats };
                }
                Some(None) => {
                    break SessionEnd::TransportLost {
                        reason: "feed channel closed".to_string(),
                        stats,
                    };
                }
            };

            stats.received += 1;
            pipeline.logger().received(stats.received, raw.event_id());

            let handling = pipeline.handle(raw);
            tokio::pin!(handling);
            let finished = tokio::select! {
                biased;
                outcome = &mut handling => Some(outcome),
                _ = &mut *shutdown => None,
            };

            match finished {
                Some(outcome) => stats.record(&outcome),
                None => {
                    state.set(SessionState::Draining);
                    info!(
                        correlation_id = %correlation_id,
                        grace = ?settings.drain_grace,
                        "Interrupt received, finishing in-flight event"
                    );
                    let drained = timeout(settings.drain_grace, &mut handling).await;
                    let abandoned_in_flight = match drained {
                        Ok(outcome) => {
                            stats.record(&outcome);
                            false
                        }
                        Err(_) => {
                            warn!(
                                correlation_id = %correlation_id,
                                "In-flight event abandoned after grace period"
                            );
                            true
                        }
                    };
                    break SessionEnd::Interrupted {
                        stats,
                        abandoned_in_flight,
                    };
                }
            }
        };

        drop(rx);
        if let Err(e) = feed.disconnect().await {
            warn!(error = %e, "Failed to release feed connection");
        }
        if let SessionEnd::TransportLost { reason, .. } = &end {
            warn!(correlation_id = %correlation_id, reason = %reason, "Feed transport lost");
        }
        end
    }
}
