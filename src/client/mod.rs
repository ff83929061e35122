use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::dispatcher::{Dispatcher, NotifyResponse, PublishRequest, Termination};
use crate::error::WorkflowError;
use crate::protocol::{FlowControl, HeaderParams, Headers, workflow_headers};

/// Options for starting a run from outside a workflow.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    pub url: String,
    pub body: String,
    /// Forwarded to every delivery of the run.
    pub headers: Headers,
    /// Generated when absent.
    pub workflow_run_id: Option<String>,
    pub retries: Option<u32>,
    pub flow_control: Option<FlowControl>,
    pub failure_url: Option<String>,
    pub delay: Option<Duration>,
}

impl TriggerOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize `body` as the initial payload.
    pub fn json_body<T: Serialize>(mut self, body: &T) -> Result<Self, WorkflowError> {
        self.body = serde_json::to_string(body).map_err(|e| WorkflowError::non_retryable(format!("encode body: {e}")))?;
        Ok(self)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn workflow_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.workflow_run_id = Some(run_id.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = Some(flow_control);
        self
    }

    pub fn failure_url(mut self, url: impl Into<String>) -> Self {
        self.failure_url = Some(url.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Thin client for control-plane operations.
///
/// Talks only to the dispatcher; it never calls workflow endpoints directly.
pub struct WorkflowClient {
    dispatcher: Arc<dyn Dispatcher>,
}

impl WorkflowClient {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Start a run. Returns its run id.
    pub async fn trigger(&self, options: TriggerOptions) -> Result<String, WorkflowError> {
        let run_id = match options.workflow_run_id {
            Some(id) if id.starts_with("wfr_") => id,
            Some(id) => format!("wfr_{id}"),
            None => format!("wfr_{}", uuid::Uuid::new_v4().simple()),
        };
        let mut params = HeaderParams::new(&run_id, &options.url, &options.headers);
        params.init = true;
        params.failure_url = options.failure_url.as_deref();
        params.retries = options.retries;
        params.flow_control = options.flow_control.as_ref();
        let headers = workflow_headers(&params).headers;

        let mut request = PublishRequest::post(&options.url, headers, options.body);
        request.delay = options.delay;
        let response = self.dispatcher.publish(request).await?;
        info!(workflow_run_id = %run_id, message_id = %response.message_id, "workflow run triggered");
        Ok(run_id)
    }

    /// Cancel a run. Cancelling an already finished run is an error from the dispatcher.
    pub async fn cancel(&self, run_id: &str) -> Result<(), WorkflowError> {
        self.dispatcher.cancel(run_id, Termination::Cancelled).await?;
        info!(workflow_run_id = %run_id, "workflow run cancelled");
        Ok(())
    }

    /// Deliver `data` to every run waiting on `event_id`.
    pub async fn notify(&self, event_id: &str, data: impl Into<String>) -> Result<Vec<NotifyResponse>, WorkflowError> {
        let data = data.into();
        let responses = self.dispatcher.notify(event_id, &data).await?;
        info!(event_id, waiters = responses.len(), "event notified");
        Ok(responses)
    }
}
