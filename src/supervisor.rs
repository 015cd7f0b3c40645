//! Lifecycle supervisor for the ingest process
//!
//! Drives Idle → Probing → Connected → Streaming and decides what happens
//! when a session ends:
//! - operator interrupt: drain, close the sink, exit cleanly
//! - probe failure or rejected credentials: fatal
//! - transport drop: fatal, or re-probe with a fresh connection when
//!   reconnecting is enabled

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ProbeConfig};
use crate::probe::{probe, FeedProbe, ProbeFailure};
use crate::session::{SessionEnd, SessionSettings, SessionStats, SubscriptionSession};
use crate::sink::PersistenceSink;
use crate::state::{SessionState, StateHandle};
use crate::streaming::{FeedError, StreamProvider};

/// Builds a fresh, unconnected feed for every session
pub type FeedFactory = Box<dyn FnMut() -> Box<dyn StreamProvider> + Send>;

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl From<&ProbeConfig> for ProbeSettings {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub probe: ProbeSettings,
    pub session: SessionSettings,
    pub reconnect_on_drop: bool,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            probe: ProbeSettings::from(&config.probe),
            session: SessionSettings::from(&config.session),
            reconnect_on_drop: config.session.reconnect_on_drop,
        }
    }
}

/// Why the supervisor stopped
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    Interrupted(SessionStats),
    ProbeFailed(ProbeFailure),
    /// The feed refused the credentials or the subscription
    FeedRejected(FeedError),
    TransportLost { reason: String, stats: SessionStats },
}

impl ExitReason {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Interrupted(_) => 0,
            Self::ProbeFailed(_) | Self::FeedRejected(_) => 1,
            Self::TransportLost { .. } => 2,
        }
    }
}

/// Lifecycle supervisor
pub struct Supervisor {
    probe: Arc<dyn FeedProbe>,
    feed_factory: FeedFactory,
    sink: Arc<dyn PersistenceSink>,
    state: StateHandle,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        probe: Arc<dyn FeedProbe>,
        feed_factory: FeedFactory,
        sink: Arc<dyn PersistenceSink>,
        state: StateHandle,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            probe,
            feed_factory,
            sink,
            state,
            settings,
        }
    }

    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Run until interrupted or a fatal condition; the sink is closed on
    /// every path.
    pub async fn run<F>(mut self, shutdown: F) -> ExitReason
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = Box::pin(shutdown);
        let mut total = SessionStats::default();
        let mut cycle: u32 = 0;

        let reason = loop {
            cycle += 1;
            self.state.set(SessionState::Probing);

            let probed = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                result = probe(
                    self.probe.as_ref(),
                    self.settings.probe.max_attempts,
                    self.settings.probe.base_delay,
                ) => Some(result),
            };
            match probed {
                None => {
                    info!("Interrupted while probing the feed");
                    break ExitReason::Interrupted(total);
                }
                Some(Err(failure)) => {
                    error!(
                        error = %failure,
                        hint = failure.hint(),
                        "Unable to reach the news feed"
                    );
                    break ExitReason::ProbeFailed(failure);
                }
                Some(Ok(report)) => {
                    debug!(cycle, attempts = report.attempts, "Probe succeeded");
                }
            }

            self.state.set(SessionState::Connected);
            let session = SubscriptionSession::new(
                (self.feed_factory)(),
                self.sink.clone(),
                self.state.clone(),
                self.settings.session.clone(),
            );

            let lost = match session.run(&mut shutdown).await {
                SessionEnd::Interrupted {
                    stats,
                    abandoned_in_flight,
                } => {
                    total.merge(&stats);
                    if abandoned_in_flight {
                        warn!("Shutdown abandoned one in-flight event");
                    }
                    break ExitReason::Interrupted(total);
                }
                SessionEnd::ConnectFailed(err) if err.is_auth() => {
                    error!(error = %err, "Feed rejected the session");
                    break ExitReason::FeedRejected(err);
                }
                SessionEnd::ConnectFailed(err) => err.to_string(),
                SessionEnd::TransportLost { reason, stats } => {
                    total.merge(&stats);
                    reason
                }
            };

            if !self.settings.reconnect_on_drop {
                error!(reason = %lost, "Feed connection lost, exiting for external restart");
                break ExitReason::TransportLost {
                    reason: lost,
                    stats: total,
                };
            }

            let delay = self.settings.probe.base_delay;
            warn!(reason = %lost, "Feed connection lost, re-probing in {:?}", delay);
            let interrupted = tokio::select! {
                biased;
                _ = &mut shutdown => true,
                _ = sleep(delay) => false,
            };
            if interrupted {
                break ExitReason::Interrupted(total);
            }
        };

        self.sink.close().await;
        self.state.set(SessionState::Terminated);
        info!(
            persisted = total.persisted,
            rejected = total.rejected,
            dropped = total.dropped,
            exit_code = reason.exit_code(),
            "Supervisor stopped"
        );
        reason
    }
}
