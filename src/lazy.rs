//! User step declarations before they become history records.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::dispatcher::{Dispatcher, NotifyResponse};
use crate::error::WorkflowError;
use crate::protocol::{FlowControl, StepOverrides, whole_seconds};
use crate::step::{Step, StepType, validate_step_name};

pub type RunFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<String, WorkflowError>> + Send>;

/// An HTTP request routed through the dispatcher; the response becomes the
/// step result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub url: String,
    pub method: String,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub flow_control: Option<FlowControl>,
}

impl CallRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            body: None,
            headers: BTreeMap::new(),
            retries: None,
            timeout: None,
            flow_control: None,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = Some(flow_control);
        self
    }
}

/// Third-party response relayed back by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    pub status: u16,
    pub body: String,
    #[serde(default)]
    pub header: BTreeMap<String, Vec<String>>,
}

/// Start another workflow and wait for its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeRequest {
    pub url: String,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub retries: Option<u32>,
    pub flow_control: Option<FlowControl>,
}

impl InvokeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: None,
            headers: BTreeMap::new(),
            retries: None,
            flow_control: None,
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Final state of an invoked workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResult {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_failed: bool,
    #[serde(default)]
    pub is_canceled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitEventResult {
    #[serde(default)]
    pub event_data: Option<String>,
    #[serde(default)]
    pub timeout: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyStepResult {
    pub event_id: String,
    pub event_data: String,
    pub notify_response: Vec<NotifyResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub webhook_url: String,
    pub event_id: String,
}

/// What a result step may need from the invocation while it is produced.
pub struct StepEnv<'a> {
    pub dispatcher: &'a dyn Dispatcher,
    pub run_id: &'a str,
}

/// A declared, not yet resolved step.
pub enum LazyStep {
    Run { name: String, func: RunFn },
    SleepFor { name: String, duration: Duration },
    SleepUntil { name: String, until: DateTime<Utc> },
    Call { name: String, request: CallRequest },
    Wait { name: String, event_id: String, timeout: Duration },
    Notify { name: String, event_id: String, data: String },
    Invoke { name: String, request: InvokeRequest },
    CreateWebhook { name: String },
    WaitForWebhook { name: String, event_id: String, timeout: Duration },
}

impl fmt::Debug for LazyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyStep")
            .field("name", &self.step_name())
            .field("type", &self.step_type())
            .finish()
    }
}

impl LazyStep {
    pub fn run<F, Fut>(name: impl Into<String>, func: F) -> Result<Self, WorkflowError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, WorkflowError>> + Send + 'static,
    {
        let name = named(name)?;
        Ok(LazyStep::Run {
            name,
            func: Box::new(move || func().boxed()),
        })
    }

    pub fn sleep(name: impl Into<String>, duration: Duration) -> Result<Self, WorkflowError> {
        Ok(LazyStep::SleepFor {
            name: named(name)?,
            duration,
        })
    }

    pub fn sleep_until(name: impl Into<String>, until: DateTime<Utc>) -> Result<Self, WorkflowError> {
        Ok(LazyStep::SleepUntil {
            name: named(name)?,
            until,
        })
    }

    pub fn call(name: impl Into<String>, request: CallRequest) -> Result<Self, WorkflowError> {
        Ok(LazyStep::Call {
            name: named(name)?,
            request,
        })
    }

    pub fn wait_for_event(
        name: impl Into<String>,
        event_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, WorkflowError> {
        Ok(LazyStep::Wait {
            name: named(name)?,
            event_id: event_id.into(),
            timeout,
        })
    }

    pub fn notify(
        name: impl Into<String>,
        event_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<Self, WorkflowError> {
        Ok(LazyStep::Notify {
            name: named(name)?,
            event_id: event_id.into(),
            data: data.into(),
        })
    }

    pub fn invoke(name: impl Into<String>, request: InvokeRequest) -> Result<Self, WorkflowError> {
        Ok(LazyStep::Invoke {
            name: named(name)?,
            request,
        })
    }

    pub fn create_webhook(name: impl Into<String>) -> Result<Self, WorkflowError> {
        Ok(LazyStep::CreateWebhook { name: named(name)? })
    }

    pub fn wait_for_webhook(name: impl Into<String>, webhook: &Webhook, timeout: Duration) -> Result<Self, WorkflowError> {
        Ok(LazyStep::WaitForWebhook {
            name: named(name)?,
            event_id: webhook.event_id.clone(),
            timeout,
        })
    }

    pub fn step_name(&self) -> &str {
        match self {
            LazyStep::Run { name, .. }
            | LazyStep::SleepFor { name, .. }
            | LazyStep::SleepUntil { name, .. }
            | LazyStep::Call { name, .. }
            | LazyStep::Wait { name, .. }
            | LazyStep::Notify { name, .. }
            | LazyStep::Invoke { name, .. }
            | LazyStep::CreateWebhook { name }
            | LazyStep::WaitForWebhook { name, .. } => name,
        }
    }

    pub fn step_type(&self) -> StepType {
        match self {
            LazyStep::Run { .. } => StepType::Run,
            LazyStep::SleepFor { .. } => StepType::SleepFor,
            LazyStep::SleepUntil { .. } => StepType::SleepUntil,
            LazyStep::Call { .. } => StepType::Call,
            LazyStep::Wait { .. } => StepType::Wait,
            LazyStep::Notify { .. } => StepType::Notify,
            LazyStep::Invoke { .. } => StepType::Invoke,
            LazyStep::CreateWebhook { .. } => StepType::CreateWebhook,
            LazyStep::WaitForWebhook { .. } => StepType::WaitForWebhook,
        }
    }

    /// Per-step header overrides (call and invoke steps only).
    pub fn overrides(&self) -> StepOverrides {
        match self {
            LazyStep::Call { request, .. } => StepOverrides {
                retries: request.retries,
                timeout: request.timeout,
                flow_control: request.flow_control.clone(),
            },
            LazyStep::Invoke { request, .. } => StepOverrides {
                retries: request.retries,
                timeout: None,
                flow_control: request.flow_control.clone(),
            },
            _ => StepOverrides::default(),
        }
    }

    /// Announcement of this step inside a parallel group.
    pub fn plan_step(&self, concurrent: usize, target_step: u64) -> Step {
        let mut step = Step::new(0, self.step_name(), self.step_type());
        step.concurrent = concurrent;
        step.target_step = Some(target_step);
        match self {
            LazyStep::SleepFor { duration, .. } => step.sleep_for = Some(whole_seconds(*duration)),
            LazyStep::SleepUntil { until, .. } => step.sleep_until = Some(until.timestamp()),
            LazyStep::Wait { event_id, timeout, .. } | LazyStep::WaitForWebhook { event_id, timeout, .. } => {
                step.wait_event_id = Some(event_id.clone());
                step.timeout = Some(whole_seconds(*timeout));
            }
            _ => {}
        }
        step
    }

    /// Produce the result record at `position`, performing the step's local
    /// side effect if it has one.
    pub async fn result_step(self, concurrent: usize, position: u64, env: &StepEnv<'_>) -> Result<Step, WorkflowError> {
        let mut step = Step::new(position, self.step_name(), self.step_type());
        step.concurrent = concurrent;
        match self {
            LazyStep::Run { func, .. } => {
                step.out = Some(func().await?);
            }
            LazyStep::SleepFor { duration, .. } => step.sleep_for = Some(whole_seconds(duration)),
            LazyStep::SleepUntil { until, .. } => step.sleep_until = Some(until.timestamp()),
            LazyStep::Call { request, .. } => {
                step.call_url = Some(request.url);
                step.call_method = Some(request.method);
                step.call_body = request.body;
                step.call_headers = Some(request.headers);
            }
            LazyStep::Wait { event_id, timeout, .. } | LazyStep::WaitForWebhook { event_id, timeout, .. } => {
                step.wait_event_id = Some(event_id);
                step.timeout = Some(whole_seconds(timeout));
            }
            LazyStep::Notify { event_id, data, .. } => {
                let notify_response = env.dispatcher.notify(&event_id, &data).await?;
                let result = NotifyStepResult {
                    event_id,
                    event_data: data,
                    notify_response,
                };
                step.out = Some(to_json(&result)?);
            }
            LazyStep::Invoke { request, .. } => {
                step.invoke_url = Some(request.url);
                step.invoke_body = request.body;
                step.invoke_headers = Some(request.headers);
            }
            LazyStep::CreateWebhook { .. } => {
                let event_id = uuid::Uuid::new_v4().simple().to_string();
                let webhook = Webhook {
                    webhook_url: format!(
                        "{}/v2/workflows/hooks/{}/{}",
                        env.dispatcher.base_url().trim_end_matches('/'),
                        env.run_id,
                        event_id
                    ),
                    event_id,
                };
                step.out = Some(to_json(&webhook)?);
            }
        }
        Ok(step)
    }
}

fn named(name: impl Into<String>) -> Result<String, WorkflowError> {
    let name = name.into();
    validate_step_name(&name)?;
    Ok(name)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, WorkflowError> {
    serde_json::to_string(value).map_err(|e| WorkflowError::malformed(format!("encode step result: {e}")))
}
