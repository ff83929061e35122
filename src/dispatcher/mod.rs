//! The external message dispatcher the engine hands work to.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::history::RawStep;
use crate::protocol::Headers;
use crate::step::Step;

pub mod error;
pub mod http;
pub mod in_memory;

pub use error::{DispatcherError, DispatcherErrorKind};
pub use http::HttpDispatcher;
pub use in_memory::{DispatcherCall, InMemoryDispatcher};

/// One HTTP request the dispatcher should deliver (at least once).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub url: String,
    pub method: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub delay: Option<Duration>,
    /// Unix seconds.
    pub not_before: Option<i64>,
}

impl PublishRequest {
    pub fn post(url: impl Into<String>, headers: Headers, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers,
            body: Some(body.into()),
            delay: None,
            not_before: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub message_id: String,
}

/// Registration of a wait-for-event step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitRequest {
    pub event_id: String,
    /// Where the notified continuation is delivered.
    pub url: String,
    pub timeout: Duration,
    /// Where the dispatcher sends its own timeout request.
    pub timeout_url: String,
    pub timeout_headers: Headers,
    pub headers: Headers,
    pub step: Step,
}

/// A workflow run that was waiting on a notified event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waiter {
    pub url: String,
    #[serde(default)]
    pub deadline: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResponse {
    pub waiter: Waiter,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a run is being terminated on the dispatcher side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// User code asked for cancellation.
    Cancelled,
    /// The run returned; carries its final output.
    Completed(Option<String>),
}

/// Durable, at-least-once dispatcher interface.
///
/// All payloads are opaque strings; implementations must pass headers through
/// verbatim.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, DispatcherError>;

    async fn batch(&self, requests: Vec<PublishRequest>) -> Result<Vec<PublishResponse>, DispatcherError>;

    async fn wait(&self, request: WaitRequest) -> Result<(), DispatcherError>;

    async fn notify(&self, event_id: &str, data: &str) -> Result<Vec<NotifyResponse>, DispatcherError>;

    async fn cancel(&self, run_id: &str, termination: Termination) -> Result<(), DispatcherError>;

    /// Full delivered history of a run, oldest first.
    async fn fetch_history(&self, run_id: &str) -> Result<Vec<RawStep>, DispatcherError>;

    /// Public base URL, used to mint webhook URLs.
    fn base_url(&self) -> &str;
}
