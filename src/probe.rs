//! Pre-flight connection probe
//!
//! Before the long-lived subscription is opened, the supervisor verifies
//! that the provider is reachable and accepts the credentials. Network
//! class failures are retried with a linear backoff (the n-th retry waits
//! `n * base_delay`); authentication and request errors end the probe at
//! once so they do not burn the attempt budget.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::AlpacaConfig;
use crate::metrics::metrics;

/// Diagnostic shown for network-class failures
pub const NETWORK_HINT: &str =
    "possible causes: no internet connectivity, provider outage, DNS resolution failure";

/// Diagnostic shown for credential/request failures
pub const AUTH_HINT: &str = "verify the API credentials and network settings";

/// Outcome of a single probe attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Connection refused, DNS failure, timeout, provider 5xx/429
    #[error("network error: {0}")]
    Network(String),

    /// Credentials rejected
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Malformed request or unexpected response
    #[error("request rejected: {0}")]
    Request(String),
}

impl ProbeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Actionable hint for the operator
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Network(_) => NETWORK_HINT,
            Self::Auth(_) | Self::Request(_) => AUTH_HINT,
        }
    }
}

/// Terminal probe failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("max retry attempts reached ({attempts}): {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: ProbeError },

    #[error("{0}")]
    Fatal(ProbeError),
}

impl ProbeFailure {
    pub fn hint(&self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded { last_error, .. } => last_error.hint(),
            Self::Fatal(err) => err.hint(),
        }
    }
}

/// Successful probe summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// One reachability/authentication check against the feed provider
#[async_trait]
pub trait FeedProbe: Send + Sync {
    async fn check(&self) -> Result<(), ProbeError>;
}

/// Linear backoff: the n-th call returns `n * base`
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    current_attempt: u32,
    base: Duration,
}

impl LinearBackoff {
    pub fn new(base: Duration) -> Self {
        Self {
            current_attempt: 0,
            base,
        }
    }

    /// Get the next backoff duration
    pub fn next_backoff(&mut self) -> Duration {
        self.current_attempt += 1;
        self.base.saturating_mul(self.current_attempt)
    }
}

/// Run `prober` until it succeeds, fails fatally, or `max_attempts` checks
/// have been made. A `max_attempts` of zero is treated as one.
pub async fn probe<P>(
    prober: &P,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<ProbeReport, ProbeFailure>
where
    P: FeedProbe + ?Sized,
{
    let max_attempts = max_attempts.max(1);
    let mut backoff = LinearBackoff::new(base_delay);
    let mut attempt = 0;

    loop {
        attempt += 1;
        metrics().probe_attempts.inc();
        info!("Testing feed connection (attempt {}/{})", attempt, max_attempts);

        match prober.check().await {
            Ok(()) => {
                info!(attempts = attempt, "Feed connection verified");
                return Ok(ProbeReport { attempts: attempt });
            }
            Err(err) if !err.is_retryable() => {
                error!(error = %err, hint = err.hint(), "Probe failed, not retrying");
                return Err(ProbeFailure::Fatal(err));
            }
            Err(err) => {
                warn!(
                    attempt,
                    max_attempts,
                    error = %err,
                    hint = NETWORK_HINT,
                    "Network error during probe"
                );
                if attempt >= max_attempts {
                    error!(attempts = attempt, "Max probe attempts reached");
                    return Err(ProbeFailure::MaxRetriesExceeded {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                let delay = backoff.next_backoff();
                info!("Retrying in {:?}", delay);
                sleep(delay).await;
            }
        }
    }
}

/// Probe backed by the provider's news REST endpoint: a bounded query for
/// today's news with a single result.
pub struct AlpacaProbe {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    secret_key: String,
}

impl AlpacaProbe {
    pub fn new(config: &AlpacaConfig, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Request(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1beta1/news", config.data_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }
}

#[async_trait]
impl FeedProbe for AlpacaProbe {
    async fn check(&self) -> Result<(), ProbeError> {
        let start = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("start", start.as_str()), ("limit", "1")])
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProbeError::Request(format!("unreadable response body: {e}")))?;
        if body.get("news").is_some_and(|news| news.is_array()) {
            Ok(())
        } else {
            Err(ProbeError::Request(
                "response does not contain a news list".into(),
            ))
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProbeError {
    if err.is_builder() {
        ProbeError::Request(err.to_string())
    } else {
        // connect, timeout, dns and mid-request transport failures
        ProbeError::Network(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> ProbeError {
    let detail = format!("HTTP {} {}", status.as_u16(), body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProbeError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => ProbeError::Network(detail),
        s if s.is_server_error() => ProbeError::Network(detail),
        _ => ProbeError::Request(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Replays scripted results and records when each check happened
    struct ScriptedProbe {
        results: Mutex<VecDeque<Result<(), ProbeError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedProbe {
        fn new(results: Vec<Result<(), ProbeError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl FeedProbe for ScriptedProbe {
        async fn check(&self) -> Result<(), ProbeError> {
            self.calls.lock().push(Instant::now());
            self.results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ProbeError::Network("script exhausted".into())))
        }
    }

    fn network() -> Result<(), ProbeError> {
        Err(ProbeError::Network("connection refused".into()))
    }

    #[test]
    fn test_linear_backoff() {
        let mut backoff = LinearBackoff::new(Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let prober = ScriptedProbe::new(vec![Ok(())]);
        let report = probe(&prober, 5, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(prober.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_retry_with_linear_delay() {
        let prober = ScriptedProbe::new(vec![network(), network(), network(), Ok(())]);
        let report = probe(&prober, 5, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.attempts, 4);

        let calls = prober.calls.lock().clone();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [5u64, 10, 15];
        for (gap, secs) in gaps.iter().zip(expected) {
            let expected = Duration::from_secs(secs);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(50),
                "gap {gap:?} expected {expected:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_never_exceed_max() {
        let prober = ScriptedProbe::new(vec![network(); 10]);
        let failure = probe(&prober, 3, Duration::from_secs(1)).await.unwrap_err();

        assert_eq!(prober.call_count(), 3);
        assert_eq!(failure.hint(), NETWORK_HINT);
        match failure {
            ProbeFailure::MaxRetriesExceeded { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.is_retryable());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_is_not_retried() {
        let prober = ScriptedProbe::new(vec![
            Err(ProbeError::Auth("HTTP 401".into())),
            Ok(()),
        ]);
        let started = Instant::now();
        let failure = probe(&prober, 5, Duration::from_secs(5)).await.unwrap_err();

        assert_eq!(prober.call_count(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(failure, ProbeFailure::Fatal(ProbeError::Auth("HTTP 401".into())));
        assert_eq!(failure.hint(), AUTH_HINT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_error_after_network_error_stops() {
        let prober = ScriptedProbe::new(vec![
            network(),
            Err(ProbeError::Request("HTTP 400".into())),
        ]);
        let failure = probe(&prober, 5, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(prober.call_count(), 2);
        assert!(matches!(failure, ProbeFailure::Fatal(ProbeError::Request(_))));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            ProbeError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "forbidden"),
            ProbeError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            ProbeError::Network(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ProbeError::Network(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad start"),
            ProbeError::Request(_)
        ));
    }
}
