use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::{
    Dispatcher, DispatcherError, NotifyResponse, PublishRequest, PublishResponse, Termination, WaitRequest, Waiter,
};
use crate::history::RawStep;
use crate::protocol::{FORWARD_PREFIX, Headers, MESSAGE_ID_HEADER, WORKFLOW_ID_HEADER, WORKFLOW_URL_HEADER};
use crate::runtime::HttpRequest;

/// Every call made against the in-memory dispatcher, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherCall {
    Publish(PublishRequest),
    Batch(Vec<PublishRequest>),
    Wait(WaitRequest),
    Notify { event_id: String, data: String },
    Cancel { run_id: String, termination: Termination },
    FetchHistory { run_id: String },
}

/// Recording dispatcher for tests and local runs.
///
/// Nothing is delivered; callers inspect `calls()` and feed deliveries back
/// to the handler themselves. Failures can be scripted per operation.
#[derive(Default)]
pub struct InMemoryDispatcher {
    calls: Mutex<Vec<DispatcherCall>>,
    histories: Mutex<HashMap<String, Vec<RawStep>>>,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    failures: Mutex<HashMap<&'static str, DispatcherError>>,
    next_message: AtomicU64,
}

impl InMemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<DispatcherCall> {
        self.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    /// All requests sent through `publish` and `batch`, flattened.
    pub async fn published(&self) -> Vec<PublishRequest> {
        self.calls
            .lock()
            .await
            .iter()
            .flat_map(|call| match call {
                DispatcherCall::Publish(req) => vec![req.clone()],
                DispatcherCall::Batch(reqs) => reqs.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// History returned by `fetch_history` for this run.
    pub async fn set_history(&self, run_id: &str, steps: Vec<RawStep>) {
        self.histories.lock().await.insert(run_id.to_string(), steps);
    }

    /// Waiters returned when `event_id` is notified.
    pub async fn add_waiter(&self, event_id: &str, waiter: Waiter) {
        self.waiters
            .lock()
            .await
            .entry(event_id.to_string())
            .or_default()
            .push(waiter);
    }

    /// Make every later call of `operation` fail with `error`.
    ///
    /// Operations: "publish", "batch", "wait", "notify", "cancel", "fetch_history".
    pub async fn fail(&self, operation: &'static str, error: DispatcherError) {
        self.failures.lock().await.insert(operation, error);
    }

    async fn record(&self, operation: &'static str, call: DispatcherCall) -> Result<(), DispatcherError> {
        self.calls.lock().await.push(call);
        match self.failures.lock().await.get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// The request the dispatcher would deliver for `published`, carrying
    /// `history` as its body.
    ///
    /// Forwarded headers lose their prefix; run id and URL pass through.
    pub fn delivery(published: &PublishRequest, history: &[RawStep], message_id: &str) -> HttpRequest {
        let mut headers = Headers::new();
        for (name, value) in published.headers.iter() {
            if let Some(forwarded) = name.strip_prefix(FORWARD_PREFIX) {
                headers.insert(forwarded, value);
            } else if name.eq_ignore_ascii_case(WORKFLOW_ID_HEADER) || name.eq_ignore_ascii_case(WORKFLOW_URL_HEADER) {
                headers.insert(name, value);
            }
        }
        headers.insert(MESSAGE_ID_HEADER, message_id);
        HttpRequest {
            method: published.method.clone(),
            url: published.url.clone(),
            headers,
            body: serde_json::to_string(history).unwrap_or_default(),
        }
    }

    fn message_id(&self) -> String {
        format!("msg-{}", self.next_message.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait::async_trait]
impl Dispatcher for InMemoryDispatcher {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, DispatcherError> {
        self.record("publish", DispatcherCall::Publish(request)).await?;
        Ok(PublishResponse {
            message_id: self.message_id(),
        })
    }

    async fn batch(&self, requests: Vec<PublishRequest>) -> Result<Vec<PublishResponse>, DispatcherError> {
        let count = requests.len();
        self.record("batch", DispatcherCall::Batch(requests)).await?;
        Ok((0..count)
            .map(|_| PublishResponse {
                message_id: self.message_id(),
            })
            .collect())
    }

    async fn wait(&self, request: WaitRequest) -> Result<(), DispatcherError> {
        self.record("wait", DispatcherCall::Wait(request)).await
    }

    async fn notify(&self, event_id: &str, data: &str) -> Result<Vec<NotifyResponse>, DispatcherError> {
        self.record(
            "notify",
            DispatcherCall::Notify {
                event_id: event_id.to_string(),
                data: data.to_string(),
            },
        )
        .await?;
        let waiters = self.waiters.lock().await.remove(event_id).unwrap_or_default();
        Ok(waiters
            .into_iter()
            .map(|waiter| NotifyResponse {
                waiter,
                message_id: self.message_id(),
                error: None,
            })
            .collect())
    }

    async fn cancel(&self, run_id: &str, termination: Termination) -> Result<(), DispatcherError> {
        self.record(
            "cancel",
            DispatcherCall::Cancel {
                run_id: run_id.to_string(),
                termination,
            },
        )
        .await
    }

    async fn fetch_history(&self, run_id: &str) -> Result<Vec<RawStep>, DispatcherError> {
        self.record(
            "fetch_history",
            DispatcherCall::FetchHistory {
                run_id: run_id.to_string(),
            },
        )
        .await?;
        self.histories
            .lock()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| DispatcherError::not_found("fetch_history", format!("workflowRun {run_id} not found")))
    }

    fn base_url(&self) -> &str {
        "http://dispatcher.local"
    }
}
