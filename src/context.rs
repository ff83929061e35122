use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::dispatcher::Dispatcher;
use crate::error::{Interrupt, StepResult, WorkflowError};
use crate::lazy::{
    CallRequest, CallResponse, InvokeRequest, InvokeResult, LazyStep, NotifyStepResult, WaitEventResult, Webhook,
};
use crate::protocol::{Headers, Invoker};
use crate::runtime::executor::{ExecutionMode, Executor, Invocation};
use crate::step::Step;

/// Handle given to workflow code for one invocation.
///
/// Cloning is cheap; clones share the same step counter and history.
/// Every step method either returns the recorded result (replay) or ends the
/// invocation with an [`Interrupt`] that must be propagated with `?`.
#[derive(Clone)]
pub struct WorkflowContext {
    executor: Arc<Executor>,
}

impl WorkflowContext {
    pub(crate) fn new(invocation: Arc<Invocation>, dispatcher: Arc<dyn Dispatcher>, mode: ExecutionMode) -> Self {
        Self {
            executor: Arc::new(Executor::new(invocation, dispatcher, mode)),
        }
    }

    /// A fresh context over the same invocation, running in `mode`.
    pub(crate) fn with_mode(&self, mode: ExecutionMode) -> Self {
        Self::new(
            self.executor.shared_invocation(),
            Arc::clone(self.executor.dispatcher()),
            mode,
        )
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn run_id(&self) -> &str {
        &self.executor.invocation().run_id
    }

    /// Canonical URL of this workflow endpoint.
    pub fn url(&self) -> &str {
        &self.executor.invocation().url
    }

    pub fn failure_url(&self) -> Option<&str> {
        self.executor.invocation().failure_url.as_deref()
    }

    /// Initial payload exactly as the run was triggered with.
    pub fn raw_payload(&self) -> &str {
        &self.executor.invocation().raw_payload
    }

    /// Initial payload decoded as JSON.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, WorkflowError> {
        serde_json::from_str(self.raw_payload())
            .map_err(|e| WorkflowError::non_retryable(format!("initial payload is not valid for this workflow: {e}")))
    }

    /// User headers of the triggering request.
    pub fn headers(&self) -> &Headers {
        &self.executor.invocation().headers
    }

    /// Deduplicated history this invocation was delivered with.
    pub fn history(&self) -> &[Step] {
        &self.executor.invocation().steps
    }

    /// Parent run, when this workflow was started through `invoke`.
    pub fn invoker(&self) -> Option<&Invoker> {
        self.executor.invocation().invoker.as_ref()
    }

    /// False during the authorization pre-flight so user logs are emitted once.
    pub fn is_logging_enabled(&self) -> bool {
        self.executor.mode() != ExecutionMode::AuthProbe
    }

    pub fn step_count(&self) -> u64 {
        self.executor.step_count()
    }

    async fn single(&self, step: LazyStep) -> StepResult<Option<String>> {
        let mut outs = self.executor.add_steps(vec![step]).await?;
        Ok(outs.pop().flatten())
    }

    /// Run `func` once per run and record its output.
    pub async fn run<F, Fut>(&self, name: &str, func: F) -> StepResult<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, WorkflowError>> + Send + 'static,
    {
        let out = self.single(LazyStep::run(name, func)?).await?;
        Ok(out.unwrap_or_default())
    }

    /// Like [`run`](Self::run) with the output stored as JSON.
    pub async fn run_typed<T, F, Fut>(&self, name: &str, func: F) -> StepResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
    {
        let step_name = name.to_string();
        let out = self
            .run(name, move || async move {
                let value = func().await?;
                serde_json::to_string(&value).map_err(|e| WorkflowError::step(step_name, e.to_string()))
            })
            .await?;
        decode_out(name, Some(out))
    }

    /// Declare a parallel group. Outputs come back in declaration order.
    pub async fn run_all(&self, steps: Vec<LazyStep>) -> StepResult<Vec<Option<String>>> {
        self.executor.add_steps(steps).await
    }

    pub async fn sleep(&self, name: &str, duration: Duration) -> StepResult<()> {
        self.single(LazyStep::sleep(name, duration)?).await?;
        Ok(())
    }

    pub async fn sleep_until(&self, name: &str, until: DateTime<Utc>) -> StepResult<()> {
        self.single(LazyStep::sleep_until(name, until)?).await?;
        Ok(())
    }

    /// HTTP call performed by the dispatcher on the workflow's behalf.
    pub async fn call(&self, name: &str, request: CallRequest) -> StepResult<CallResponse> {
        let out = self.single(LazyStep::call(name, request)?).await?;
        decode_out(name, out)
    }

    pub async fn wait_for_event(&self, name: &str, event_id: &str, timeout: Duration) -> StepResult<WaitEventResult> {
        let out = self.single(LazyStep::wait_for_event(name, event_id, timeout)?).await?;
        decode_out(name, out)
    }

    pub async fn notify(&self, name: &str, event_id: &str, data: &str) -> StepResult<NotifyStepResult> {
        let out = self.single(LazyStep::notify(name, event_id, data)?).await?;
        decode_out(name, out)
    }

    /// Start another workflow and suspend until it finishes.
    pub async fn invoke(&self, name: &str, request: InvokeRequest) -> StepResult<InvokeResult> {
        let out = self.single(LazyStep::invoke(name, request)?).await?;
        decode_out(name, out)
    }

    pub async fn create_webhook(&self, name: &str) -> StepResult<Webhook> {
        let out = self.single(LazyStep::create_webhook(name)?).await?;
        decode_out(name, out)
    }

    pub async fn wait_for_webhook(&self, name: &str, webhook: &Webhook, timeout: Duration) -> StepResult<WaitEventResult> {
        let out = self.single(LazyStep::wait_for_webhook(name, webhook, timeout)?).await?;
        decode_out(name, out)
    }

    /// Cancel the run. Always returns `Err`; propagate it with `?`.
    pub fn cancel(&self) -> StepResult<()> {
        self.executor.cancel()
    }
}

fn decode_out<T: DeserializeOwned>(name: &str, out: Option<String>) -> StepResult<T> {
    let raw = out.ok_or_else(|| {
        Interrupt::Failed(WorkflowError::malformed(format!("step '{name}' has no recorded result")))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        Interrupt::Failed(WorkflowError::malformed(format!("step '{name}' result could not be decoded: {e}")))
    })
}
