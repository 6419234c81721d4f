//! Resilient client: retries, per-attempt deadlines and the circuit breaker
//! wrapped around a raw transport.

use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tillsync_common::{Clock, Error, Result};

use crate::breaker::{CircuitBreaker, CircuitState, Permit};
use crate::config::ClientConfig;
use crate::retry::{should_retry, RetryConfig};
use crate::transport::{ApiRequest, HttpTransport, ReqwestTransport};

/// HTTP client shared by the sync engine and the event log.
///
/// The circuit breaker is process-wide: one instance guards every call made
/// through this client.
pub struct ResilientClient {
    transport: Arc<dyn HttpTransport>,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl ResilientClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: &ClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            breaker: CircuitBreaker::new(config.breaker_config(), clock),
            retry: config.retry_config(),
            timeout: config.timeout(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Client talking to `config.base_url` over HTTP.
    pub fn from_config(config: &ClientConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), config, clock))
    }

    /// Replace the retry policy (tests use zero delays).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Cancel every in-flight and future attempt.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Execute a request with retries.
    ///
    /// # Errors
    /// - `CircuitOpen` immediately, without I/O, while the breaker is open
    /// - `Timeout` if the last attempt timed out or the call was cancelled
    /// - The last attempt's typed error otherwise
    pub async fn execute(&self, request: ApiRequest) -> Result<Value> {
        let max_attempts = request.max_attempts.unwrap_or(self.retry.max_attempts).max(1);
        let deadline = request.timeout.unwrap_or(self.timeout);
        let mut attempt = 0;

        loop {
            let permit = self.breaker.try_acquire()?;
            attempt += 1;
            debug!(
                "{} {} (attempt {}/{})",
                request.method, request.path, attempt, max_attempts
            );

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(Cancelled),
                _ = cancelled(request.cancel.as_ref()) => Err(Cancelled),
                result = timeout(deadline, self.transport.send(&request)) => {
                    Ok(result.unwrap_or(Err(Error::Timeout)))
                }
            };

            let err = match result {
                Err(Cancelled) => {
                    self.breaker.record_neutral(permit);
                    return Err(Error::Timeout);
                }
                Ok(Ok(body)) => {
                    self.breaker.record_success(permit);
                    return Ok(body);
                }
                Ok(Err(err)) => err,
            };

            self.record_outcome(permit, &err);

            if attempt >= max_attempts || !should_retry(&request.method, &err) {
                if attempt > 1 {
                    warn!(
                        "{} {} failed after {} attempts: {}",
                        request.method, request.path, attempt, err
                    );
                }
                return Err(err);
            }

            let delay = self.retry.delay_for_attempt(attempt - 1);
            warn!(
                "Attempt {} of {} {} failed: {}. Retrying in {:?}...",
                attempt, request.method, request.path, err, delay
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Err(Error::Timeout),
                _ = cancelled(request.cancel.as_ref()) => return Err(Error::Timeout),
            }
        }
    }

    pub async fn get(&self, path: impl Into<String>) -> Result<Value> {
        self.execute(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: impl Into<String>, body: Value) -> Result<Value> {
        self.execute(ApiRequest::post(path, body)).await
    }

    pub async fn put(&self, path: impl Into<String>, body: Value) -> Result<Value> {
        self.execute(ApiRequest::put(path, body)).await
    }

    pub async fn delete(&self, path: impl Into<String>) -> Result<Value> {
        self.execute(ApiRequest::new(Method::DELETE, path)).await
    }

    fn record_outcome(&self, permit: Permit, err: &Error) {
        if err.trips_breaker() {
            self.breaker.record_failure(permit);
        } else {
            self.breaker.record_neutral(permit);
        }
    }
}

struct Cancelled;

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
