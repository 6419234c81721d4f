//! Scripted transport for deterministic tests.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tillsync_common::{Error, Result};

use crate::transport::{ApiRequest, HttpTransport};

/// Canned outcome of one attempt.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Value),
    Status {
        status: u16,
        message: String,
        code: Option<String>,
    },
    Timeout,
    Network { message: String, blocked: bool },
    /// Never answer before the given delay, then succeed with `null`.
    Hang(Duration),
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Reply::Ok(body)
    }

    pub fn status(status: u16, message: &str) -> Self {
        Reply::Status {
            status,
            message: message.to_string(),
            code: None,
        }
    }

    pub fn rejected(status: u16, message: &str, code: &str) -> Self {
        Reply::Status {
            status,
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    fn into_result(self) -> Result<Value> {
        match self {
            Reply::Ok(body) => Ok(body),
            Reply::Status {
                status,
                message,
                code,
            } => Err(Error::from_status(status, message, code)),
            Reply::Timeout => Err(Error::Timeout),
            Reply::Network { message, blocked } => Err(Error::Network { message, blocked }),
            Reply::Hang(_) => Ok(Value::Null),
        }
    }
}

/// A request as seen by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub idempotency_key: Option<String>,
}

type Route = (Method, String);

/// Transport answering from per-route scripts.
///
/// Queued replies are consumed first; a route's standing reply answers once
/// its queue is empty. Unscripted requests fail with a blocked network error
/// so they neither retry nor touch the breaker.
#[derive(Default)]
pub struct ScriptedTransport {
    queued: Mutex<HashMap<Route, VecDeque<Reply>>>,
    standing: Mutex<HashMap<Route, Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next matching request with `reply`.
    pub fn push(&self, method: Method, path: &str, reply: Reply) {
        lock(&self.queued)
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// Answer every matching request with `reply` once the queue is drained.
    pub fn always(&self, method: Method, path: &str, reply: Reply) {
        lock(&self.standing).insert((method, path.to_string()), reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Calls made to one route.
    pub fn calls_to(&self, method: &Method, path: &str) -> Vec<RecordedCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| &call.method == method && call.path == path)
            .cloned()
            .collect()
    }

    fn next_reply(&self, route: &Route) -> Option<Reply> {
        if let Some(reply) = lock(&self.queued).get_mut(route).and_then(VecDeque::pop_front) {
            return Some(reply);
        }
        lock(&self.standing).get(route).cloned()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Value> {
        lock(&self.calls).push(RecordedCall {
            method: request.method.clone(),
            path: request.path.clone(),
            body: request.body.clone(),
            idempotency_key: request.idempotency_key.clone(),
        });

        let route = (request.method.clone(), request.path.clone());
        match self.next_reply(&route) {
            Some(Reply::Hang(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(Value::Null)
            }
            Some(reply) => reply.into_result(),
            None => Err(Error::Network {
                message: format!("no scripted reply for {} {}", request.method, request.path),
                blocked: true,
            }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
