//! Request/response boundary: turns one inbound delivery into one response.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::WorkflowOptions;
use crate::context::WorkflowContext;
use crate::dispatcher::{Dispatcher, PublishRequest, Termination};
use crate::error::{ConfigErrorKind, Interrupt, StepResult, Suspension, WorkflowError};
use crate::history::{self, ParsedHistory};
use crate::lazy::InvokeResult;
use crate::protocol::{
    HeaderParams, Headers, Invoker, MESSAGE_ID_HEADER, NON_RETRYABLE_ERROR_HEADER, RETRY_AFTER_HEADER,
    WORKFLOW_CALLBACK_HEADER, WORKFLOW_FAILURE_HEADER, WORKFLOW_ID_HEADER, check_protocol_version, whole_seconds,
    workflow_headers,
};

pub mod auth;
mod callbacks;
pub mod executor;
pub mod observability;

pub use auth::AuthOutcome;
pub use callbacks::WorkflowFailure;
pub use executor::{ExecutionMode, Executor, Invocation, ParallelState, parallel_state};

/// Framework-neutral inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: String,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Framework-neutral response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

impl HttpResponse {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: Headers::new().with("Content-Type", "application/json"),
            body: body.to_string(),
        }
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Why an invocation ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishCondition {
    Success,
    DuplicateStep,
    FromCallback,
    CallWillRetry,
    AuthFail,
    FailureCallback,
    WorkflowAlreadyEnded,
}

impl FinishCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishCondition::Success => "success",
            FinishCondition::DuplicateStep => "duplicate-step",
            FinishCondition::FromCallback => "fromCallback",
            FinishCondition::CallWillRetry => "call-will-retry",
            FinishCondition::AuthFail => "auth-fail",
            FinishCondition::FailureCallback => "failure-callback",
            FinishCondition::WorkflowAlreadyEnded => "workflow-already-ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finish {
    pub workflow_run_id: String,
    pub condition: FinishCondition,
}

impl Finish {
    fn new(workflow_run_id: impl Into<String>, condition: FinishCondition) -> Self {
        Self {
            workflow_run_id: workflow_run_id.into(),
            condition,
        }
    }

    pub fn into_response(self) -> HttpResponse {
        let status = match self.condition {
            FinishCondition::AuthFail => 400,
            _ => 200,
        };
        HttpResponse::json(
            status,
            json!({
                "workflowRunId": self.workflow_run_id,
                "finishCondition": self.condition.as_str(),
            }),
        )
    }
}

/// How one run of user code ended.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    /// The workflow returned; carries its output.
    Finished(String),
    Suspended(Suspension),
    Cancelled,
    Failed(WorkflowError),
}

/// Map a failure onto the status code the dispatcher understands.
pub fn error_response(err: &WorkflowError) -> HttpResponse {
    let body = json!({ "error": err.name(), "message": err.to_string() });
    match err {
        WorkflowError::NonRetryable { .. } => {
            let mut response = HttpResponse::json(489, body);
            response.headers.insert(NON_RETRYABLE_ERROR_HEADER, "true");
            response
        }
        WorkflowError::RetryAfter { delay, .. } => {
            let mut response = HttpResponse::json(429, body);
            response.headers.insert(RETRY_AFTER_HEADER, whole_seconds(*delay).to_string());
            response
        }
        _ => HttpResponse::json(500, body),
    }
}

/// User workflow code.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext) -> StepResult<String>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = StepResult<String>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = StepResult<String>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext) -> StepResult<String> {
        (self.0)(ctx).await
    }
}

/// Called when the dispatcher gives up on a run.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_failure(&self, failure: WorkflowFailure) -> Result<(), WorkflowError>;
}

/// Function wrapper that implements `FailureHandler`.
pub struct FnFailure<F, Fut>(pub F)
where
    F: Fn(WorkflowFailure) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), WorkflowError>> + Send + 'static;

#[async_trait]
impl<F, Fut> FailureHandler for FnFailure<F, Fut>
where
    F: Fn(WorkflowFailure) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), WorkflowError>> + Send + 'static,
{
    async fn on_failure(&self, failure: WorkflowFailure) -> Result<(), WorkflowError> {
        (self.0)(failure).await
    }
}

/// Run workflow code once under `ctx` and classify how it ended.
pub async fn run_workflow(handler: &dyn WorkflowHandler, ctx: &WorkflowContext) -> InvocationResult {
    let result = handler.invoke(ctx.clone()).await;
    // The first interrupt raised by a step wins, even if user code swallowed it.
    let interrupt = match (ctx.executor().recorded_interrupt(), result) {
        (Some(interrupt), _) | (None, Err(interrupt)) => interrupt,
        (None, Ok(output)) => return InvocationResult::Finished(output),
    };
    match interrupt {
        Interrupt::Suspended(suspension) => InvocationResult::Suspended(suspension),
        Interrupt::Cancelled => InvocationResult::Cancelled,
        Interrupt::Failed(err) => InvocationResult::Failed(err),
        Interrupt::AuthProbe => InvocationResult::Failed(WorkflowError::step(
            "auth",
            "authorization probe signal escaped the pre-flight",
        )),
    }
}

/// One workflow endpoint.
pub struct WorkflowService {
    handler: Arc<dyn WorkflowHandler>,
    failure_handler: Option<Arc<dyn FailureHandler>>,
    dispatcher: Arc<dyn Dispatcher>,
    options: WorkflowOptions,
}

impl WorkflowService {
    pub fn new(handler: impl WorkflowHandler + 'static, dispatcher: Arc<dyn Dispatcher>, options: WorkflowOptions) -> Self {
        Self {
            handler: Arc::new(handler),
            failure_handler: None,
            dispatcher,
            options,
        }
    }

    pub fn with_failure_handler(mut self, handler: impl FailureHandler + 'static) -> Self {
        self.failure_handler = Some(Arc::new(handler));
        self
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    pub(crate) fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Failure destination: this endpoint when a failure handler is
    /// registered, otherwise the configured failure URL.
    fn failure_url(&self, workflow_url: &str) -> Option<String> {
        match self.failure_handler {
            Some(_) => Some(workflow_url.to_string()),
            None => self.options.failure_url.clone(),
        }
    }

    pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
        match self.process(&request).await {
            Ok(finish) => {
                info!(
                    workflow_run_id = %finish.workflow_run_id,
                    finish_condition = finish.condition.as_str(),
                    "invocation finished"
                );
                finish.into_response()
            }
            Err(err) => {
                error!(
                    workflow_run_id = request.headers.get(WORKFLOW_ID_HEADER).unwrap_or_default(),
                    error = %err,
                    "invocation failed"
                );
                error_response(&err)
            }
        }
    }

    pub async fn process(&self, request: &HttpRequest) -> Result<Finish, WorkflowError> {
        let headers = &request.headers;
        let is_first_invocation = check_protocol_version(headers)
            .map_err(|m| WorkflowError::configuration(ConfigErrorKind::ProtocolVersionMismatch, m.to_string()))?;
        let url = self.options.workflow_url(&request.url)?;

        if headers.get(WORKFLOW_CALLBACK_HEADER) == Some("true") {
            return callbacks::handle_third_party_callback(self, request, &url).await;
        }
        if headers.get(WORKFLOW_FAILURE_HEADER) == Some("true") {
            return callbacks::handle_failure_callback(self, request, &url, self.failure_handler.as_deref()).await;
        }

        let run_id = match headers.get(WORKFLOW_ID_HEADER).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None if is_first_invocation => new_run_id(),
            None => {
                return Err(WorkflowError::configuration(
                    ConfigErrorKind::MissingRunId,
                    "couldn't get workflow id from header",
                ));
            }
        };

        let parsed = if is_first_invocation {
            ParsedHistory::first_invocation(request.body.clone())
        } else {
            history::parse_request(
                &request.body,
                &run_id,
                headers.get(MESSAGE_ID_HEADER),
                self.dispatcher.as_ref(),
            )
            .await?
        };
        if parsed.run_ended {
            return Ok(Finish::new(run_id, FinishCondition::WorkflowAlreadyEnded));
        }
        if parsed.is_duplicate {
            info!(workflow_run_id = %run_id, "duplicate delivery, nothing to do");
            return Ok(Finish::new(run_id, FinishCondition::DuplicateStep));
        }

        let invocation = Invocation {
            failure_url: self.failure_url(&url),
            run_id,
            url,
            raw_payload: parsed.raw_initial_payload,
            headers: headers.user_headers(),
            steps: parsed.steps,
            retries: self.options.retries,
            flow_control: self.options.flow_control.clone(),
            invoker: Invoker::from_headers(headers),
        };
        let ctx = WorkflowContext::new(Arc::new(invocation), Arc::clone(&self.dispatcher), ExecutionMode::Live);

        if auth::try_authentication(self.handler.as_ref(), &ctx).await? == AuthOutcome::Rejected {
            let run_id = if is_first_invocation { "no-workflow-id" } else { ctx.run_id() };
            return Ok(Finish::new(run_id, FinishCondition::AuthFail));
        }

        if is_first_invocation {
            self.trigger_first_invocation(&ctx).await?;
            return Ok(Finish::new(ctx.run_id(), FinishCondition::Success));
        }

        match run_workflow(self.handler.as_ref(), &ctx).await {
            InvocationResult::Finished(output) => self.complete_run(&ctx, output).await?,
            InvocationResult::Suspended(suspension) => {
                debug!(
                    workflow_run_id = %ctx.run_id(),
                    step_name = %suspension.step_name,
                    position = suspension.position,
                    reason = ?suspension.reason,
                    "invocation suspended"
                );
            }
            InvocationResult::Cancelled => self.cancel_run(&ctx).await?,
            InvocationResult::Failed(err) => return Err(err),
        }
        Ok(Finish::new(ctx.run_id(), FinishCondition::Success))
    }

    async fn trigger_first_invocation(&self, ctx: &WorkflowContext) -> Result<(), WorkflowError> {
        let inv = ctx.executor().invocation();
        let mut params = HeaderParams::new(&inv.run_id, &inv.url, &inv.headers);
        params.init = true;
        params.failure_url = inv.failure_url.as_deref();
        params.retries = inv.retries;
        params.flow_control = inv.flow_control.as_ref();
        params.invoker = inv.invoker.as_ref();
        let headers = workflow_headers(&params).headers;
        let response = self
            .dispatcher
            .publish(PublishRequest::post(&inv.url, headers, inv.raw_payload.clone()))
            .await?;
        info!(workflow_run_id = %inv.run_id, message_id = %response.message_id, "workflow run started");
        Ok(())
    }

    async fn complete_run(&self, ctx: &WorkflowContext, output: String) -> Result<(), WorkflowError> {
        if let Some(invoker) = ctx.invoker() {
            let result = InvokeResult {
                body: Some(output.clone()),
                is_failed: false,
                is_canceled: false,
            };
            callbacks::notify_invoker(self.dispatcher.as_ref(), invoker, result).await?;
        }
        self.terminate(ctx.run_id(), Termination::Completed(Some(output))).await
    }

    /// Cancel the run itself first; telling the parent is best-effort.
    async fn cancel_run(&self, ctx: &WorkflowContext) -> Result<(), WorkflowError> {
        self.terminate(ctx.run_id(), Termination::Cancelled).await?;
        if let Some(invoker) = ctx.invoker() {
            let result = InvokeResult {
                body: None,
                is_failed: false,
                is_canceled: true,
            };
            if let Err(err) = callbacks::notify_invoker(self.dispatcher.as_ref(), invoker, result).await {
                warn!(
                    workflow_run_id = %ctx.run_id(),
                    parent_run_id = %invoker.run_id,
                    error = %err,
                    "failed to tell the parent run about the cancellation"
                );
            }
        }
        Ok(())
    }

    async fn terminate(&self, run_id: &str, termination: Termination) -> Result<(), WorkflowError> {
        match self.dispatcher.cancel(run_id, termination).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_run_ended() => {
                debug!(workflow_run_id = %run_id, error = %err, "run already ended on the dispatcher");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn new_run_id() -> String {
    format!("wfr_{}", uuid::Uuid::new_v4().simple())
}
