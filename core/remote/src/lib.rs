//! Resilient network client for tillsync.
//!
//! Every remote call made by the sync core goes through [`ResilientClient`],
//! which adds per-attempt deadlines, bounded retries with backoff, and a
//! process-wide circuit breaker on top of an [`HttpTransport`].

pub mod breaker;
pub mod client;
pub mod config;
pub mod retry;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState, Permit};
pub use client::ResilientClient;
pub use config::ClientConfig;
pub use retry::{should_retry, RetryConfig};
pub use transport::{resource_path, ApiRequest, HttpTransport, ReqwestTransport};

/// HTTP method type used by [`ApiRequest`].
pub use reqwest::Method;
/// Cancellation handle accepted by [`ApiRequest::with_cancellation`].
pub use tokio_util::sync::CancellationToken;
