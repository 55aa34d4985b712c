use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::latency::LatencyStats;
use crate::config::FETCH_TIMEOUT_SECS;
use crate::fetch::retry::RetryPolicy;
use crate::fetch::transport::{HttpTransport, TransportError};

/// Terminal failure of a logical fetch: retries exhausted or a non-retryable error.
#[derive(Debug, Clone, Error)]
#[error("{endpoint} failed after {attempts} attempt(s): {cause}")]
pub struct FetchError {
    pub endpoint: String,
    pub attempts: u32,
    #[source]
    pub cause: TransportError,
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        self.cause.is_not_found()
    }
}

/// User-facing progress notices. Delivery is best-effort and never delays a retry.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchNotice {
    Retrying {
        endpoint: String,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        cause: String,
    },
    /// Succeeded after at least one failed attempt.
    Recovered { endpoint: String, attempts: u32 },
    Failed {
        endpoint: String,
        attempts: u32,
        cause: String,
    },
}

/// Retrying JSON GET client. Holds no per-call state, so one instance serves
/// any number of concurrent calls.
pub struct FetchClient {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    timeout: Duration,
    notices: Option<mpsc::Sender<FetchNotice>>,
    latency: Option<Arc<LatencyStats>>,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            timeout: Duration::from_secs(FETCH_TIMEOUT_SECS),
            notices: None,
            latency: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_notices(mut self, tx: mpsc::Sender<FetchNotice>) -> Self {
        self.notices = Some(tx);
        self
    }

    pub fn with_latency(mut self, stats: Arc<LatencyStats>) -> Self {
        self.latency = Some(stats);
        self
    }

    /// GET `{base}{endpoint}?{params}` with the client's default policy and timeout.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        base: &str,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        self.get_json_with(base, endpoint, params, &self.policy, self.timeout)
            .await
    }

    /// GET with an explicit policy and per-attempt timeout.
    ///
    /// Attempts run `Attempting(1) -> Success | Attempting(n+1) | TerminalFailure`.
    /// After failed attempt `n` the client sleeps `policy.delay_for_attempt(n)`.
    pub async fn get_json_with<T: DeserializeOwned>(
        &self,
        base: &str,
        endpoint: &str,
        params: &[(&str, String)],
        policy: &RetryPolicy,
        timeout: Duration,
    ) -> Result<T, FetchError> {
        let url = match build_url(base, endpoint, params) {
            Ok(u) => u,
            Err(cause) => {
                return Err(FetchError { endpoint: endpoint.to_string(), attempts: 0, cause })
            }
        };
        let max_attempts = policy.max_attempts();
        let mut attempt = 1u32;

        loop {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, self.transport.get_json(&url)).await
            {
                Ok(res) => res,
                // Dropping the transport future aborts the in-flight request.
                Err(_) => Err(TransportError::Timeout),
            };
            let outcome = outcome.and_then(|v| {
                serde_json::from_value::<T>(v).map_err(|e| TransportError::Decode(e.to_string()))
            });

            match outcome {
                Ok(value) => {
                    if let Some(stats) = &self.latency {
                        stats.record(started.elapsed());
                    }
                    if attempt >= 2 {
                        info!(endpoint, attempts = attempt, "Upstream recovered after {attempt} attempts");
                        self.notify(FetchNotice::Recovered {
                            endpoint: endpoint.to_string(),
                            attempts: attempt,
                        });
                    }
                    return Ok(value);
                }
                Err(cause) => {
                    if !policy.should_retry(&cause) || attempt >= max_attempts {
                        if cause.is_not_found() {
                            debug!(endpoint, "Upstream returned 404");
                        } else {
                            warn!(endpoint, attempts = attempt, "Fetch failed: {cause}");
                            self.notify(FetchNotice::Failed {
                                endpoint: endpoint.to_string(),
                                attempts: attempt,
                                cause: cause.to_string(),
                            });
                        }
                        return Err(FetchError {
                            endpoint: endpoint.to_string(),
                            attempts: attempt,
                            cause,
                        });
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        endpoint,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch attempt {attempt}/{max_attempts} failed: {cause}; retrying",
                    );
                    self.notify(FetchNotice::Retrying {
                        endpoint: endpoint.to_string(),
                        attempt,
                        max_attempts,
                        delay,
                        cause: cause.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn notify(&self, notice: FetchNotice) {
        if let Some(tx) = &self.notices {
            // try_send: a slow consumer must never hold up the retry loop.
            let _ = tx.try_send(notice);
        }
    }
}

pub(crate) fn build_url(base: &str, endpoint: &str, params: &[(&str, String)]) -> Result<String, TransportError> {
    let raw = format!("{}{}", base.trim_end_matches('/'), endpoint);
    let url = if params.is_empty() {
        reqwest::Url::parse(&raw)
    } else {
        reqwest::Url::parse_with_params(&raw, params.iter().map(|(k, v)| (*k, v.as_str())))
    };
    url.map(String::from)
        .map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
