//! HTTP transport: one raw attempt per call.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use tillsync_common::{Error, Result};

use crate::config::ClientConfig;

/// Header carrying the client-chosen idempotency key on writes.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Characters left as-is in an id path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Path of one resource in a collection, with the id percent-encoded.
pub fn resource_path(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, utf8_percent_encode(id, PATH_SEGMENT))
}

/// A call to the POS API.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, e.g. `products/p-1`.
    pub path: String,
    pub body: Option<Value>,
    pub idempotency_key: Option<String>,
    /// Overrides the client's attempt limit.
    pub max_attempts: Option<u32>,
    /// Overrides the client's per-attempt deadline.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            idempotency_key: None,
            max_attempts: None,
            timeout: None,
            cancel: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Performs a single attempt of a request.
///
/// Non-2xx responses are returned as typed errors; the JSON body of a 2xx is
/// returned as-is (`Value::Null` when empty).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<Value>;
}

/// Transport over `reqwest`.
pub struct ReqwestTransport {
    http: Client,
    base_url: Url,
}

impl ReqwestTransport {
    /// # Errors
    /// - `InvalidInput` if the base URL does not parse
    /// - `Network` if the HTTP client cannot be built
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url).map_err(|e| {
            Error::InvalidInput(format!("Invalid base URL {}: {}", config.base_url, e))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| Error::network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("Invalid request path {}: {}", path, e)))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Value> {
        let url = self.endpoint(&request.path)?;
        debug!("{} {}", request.method, url);

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .header(header::ACCEPT, "application/json");
        if let Some(key) = &request.idempotency_key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_send_error)?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::network(format!("Failed to read response body: {}", e)))?;
        let body = if text.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<Value>(&text).ok()
        };

        if status.is_success() {
            return Ok(body.unwrap_or(Value::Null));
        }

        let (message, code) = error_details(status, body.as_ref(), &text);
        Err(Error::from_status(status.as_u16(), message, code))
    }
}

fn classify_send_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::Timeout;
    }
    // Redirect and request-construction failures come from local policy,
    // not from the server.
    let blocked = err.is_redirect() || err.is_builder();
    Error::Network {
        message: err.to_string(),
        blocked,
    }
}

/// Extract the server's message and rejection code from an error response.
///
/// `message` wins over `error`; a non-JSON body is used verbatim.
pub fn error_details(
    status: StatusCode,
    body: Option<&Value>,
    raw: &str,
) -> (String, Option<String>) {
    let field = |name: &str| {
        body.and_then(|b| b.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let message = field("message")
        .or_else(|| field("error"))
        .or_else(|| {
            let raw = raw.trim();
            (body.is_none() && !raw.is_empty()).then(|| raw.to_string())
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        });

    (message, field("code"))
}
