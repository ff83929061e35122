//! Deliveries that are not ordinary continuations: third-party call results,
//! failure callbacks, and results sent back to an invoking parent.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use super::{Finish, FinishCondition, FailureHandler, WorkflowService};
use crate::context::WorkflowContext;
use crate::dispatcher::{Dispatcher, PublishRequest};
use crate::error::{ConfigErrorKind, WorkflowError};
use crate::history::{ParsedHistory, RawStep, fetch_entry_body, parse_history};
use crate::lazy::{CallResponse, InvokeResult};
use crate::protocol::{
    CALLBACK_CONCURRENT_HEADER, CALLBACK_STEP_ID_HEADER, CALLBACK_STEP_NAME_HEADER, CALLBACK_STEP_TYPE_HEADER,
    HeaderParams, Headers, Invoker, MESSAGE_ID_HEADER, WORKFLOW_ID_HEADER, WORKFLOW_URL_HEADER, workflow_headers,
};
use crate::runtime::executor::{ExecutionMode, Invocation};
use crate::step::{Step, StepType, decode_base64};

/// What the dispatcher relays after calling a third-party URL.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackMessage {
    status: u16,
    #[serde(default)]
    header: BTreeMap<String, Vec<String>>,
    /// Base64 of the third-party response body.
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    retried: Option<u32>,
    #[serde(default)]
    max_retries: Option<u32>,
}

/// What the dispatcher sends when it gives up on a run.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailurePayload {
    status: u16,
    #[serde(default)]
    header: BTreeMap<String, Vec<String>>,
    /// Base64 of the failing response body.
    #[serde(default)]
    body: Option<String>,
    /// Base64 of the request body that failed (the delivered history).
    #[serde(default)]
    source_body: Option<String>,
}

/// Passed to the failure handler of a run the dispatcher gave up on.
pub struct WorkflowFailure {
    /// Context rebuilt from the failed delivery. Steps cannot be declared on it.
    pub context: WorkflowContext,
    pub status: u16,
    /// Error message of the last failed attempt, or its raw response body.
    pub message: String,
    pub headers: BTreeMap<String, Vec<String>>,
}

fn required<'a>(headers: &'a Headers, name: &str) -> Result<&'a str, WorkflowError> {
    headers
        .get(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| WorkflowError::malformed(format!("callback is missing the {name} header")))
}

fn run_id_header(headers: &Headers) -> Result<&str, WorkflowError> {
    headers
        .get(WORKFLOW_ID_HEADER)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| WorkflowError::configuration(ConfigErrorKind::MissingRunId, "couldn't get workflow id from header"))
}

/// Turn a relayed third-party response into the call step's result.
pub(super) async fn handle_third_party_callback(
    service: &WorkflowService,
    request: &crate::runtime::HttpRequest,
    url: &str,
) -> Result<Finish, WorkflowError> {
    let headers = &request.headers;
    let run_id = run_id_header(headers)?.to_string();
    let body = if request.body.trim().is_empty() {
        match fetch_entry_body(&run_id, headers.get(MESSAGE_ID_HEADER), service.dispatcher().as_ref()).await? {
            Some(body) => body,
            None => return Ok(Finish::new(run_id, FinishCondition::WorkflowAlreadyEnded)),
        }
    } else {
        request.body.clone()
    };
    let message: CallbackMessage =
        serde_json::from_str(&body).map_err(|e| WorkflowError::malformed(format!("callback body: {e}")))?;

    let succeeded = (200..300).contains(&message.status);
    let retries_left = message.retried.unwrap_or(0) < message.max_retries.unwrap_or(0);
    if !succeeded && retries_left {
        warn!(
            workflow_run_id = %run_id,
            status = message.status,
            retried = message.retried.unwrap_or(0),
            "third-party call failed, dispatcher will retry"
        );
        return Ok(Finish::new(run_id, FinishCondition::CallWillRetry));
    }

    let step_id: u64 = required(headers, CALLBACK_STEP_ID_HEADER)?
        .parse()
        .map_err(|e| WorkflowError::malformed(format!("callback step id: {e}")))?;
    let step_name = required(headers, CALLBACK_STEP_NAME_HEADER)?;
    let step_type: StepType = required(headers, CALLBACK_STEP_TYPE_HEADER)?.parse()?;
    let concurrent = headers
        .get(CALLBACK_CONCURRENT_HEADER)
        .and_then(|c| c.parse().ok())
        .unwrap_or(1);
    let body = match message.body.as_deref() {
        Some(encoded) if !encoded.is_empty() => decode_base64(encoded)?,
        _ => String::new(),
    };
    let response = CallResponse {
        status: message.status,
        body,
        header: message.header,
    };

    let mut step = Step::new(step_id, step_name, step_type);
    step.concurrent = concurrent;
    step.out = Some(
        serde_json::to_string(&response).map_err(|e| WorkflowError::malformed(format!("encode call result: {e}")))?,
    );

    let workflow_url = headers.get(WORKFLOW_URL_HEADER).unwrap_or(url).to_string();
    let user_headers = headers.user_headers();
    let invoker = Invoker::from_headers(headers);
    let failure_url = service.failure_url(&workflow_url);
    let options = service.options();
    let mut params = HeaderParams::new(&run_id, &workflow_url, &user_headers);
    params.failure_url = failure_url.as_deref();
    params.retries = options.retries;
    params.flow_control = options.flow_control.as_ref();
    params.invoker = invoker.as_ref();
    params.step = Some(&step);
    let continuation = workflow_headers(&params).headers;

    service
        .dispatcher()
        .publish(PublishRequest::post(&workflow_url, continuation, step.encode_body()?))
        .await?;
    info!(workflow_run_id = %run_id, step_id, status = message.status, "call result relayed");
    Ok(Finish::new(run_id, FinishCondition::FromCallback))
}

/// Rebuild the failed run's context and hand it to the failure handler.
pub(super) async fn handle_failure_callback(
    service: &WorkflowService,
    request: &crate::runtime::HttpRequest,
    url: &str,
    failure_handler: Option<&dyn FailureHandler>,
) -> Result<Finish, WorkflowError> {
    let Some(failure_handler) = failure_handler else {
        return Err(WorkflowError::configuration(
            ConfigErrorKind::MissingFailureHandler,
            "workflow endpoint is called to handle a failure, but no failure handler is registered",
        ));
    };
    let headers = &request.headers;
    let run_id = run_id_header(headers)?.to_string();
    let payload: FailurePayload = serde_json::from_str(&request.body)
        .map_err(|e| WorkflowError::malformed(format!("failure callback body: {e}")))?;

    let response_body = match payload.body.as_deref() {
        Some(encoded) if !encoded.is_empty() => decode_base64(encoded)?,
        _ => String::new(),
    };
    let message = serde_json::from_str::<serde_json::Value>(&response_body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or(response_body);

    let history = match payload.source_body.as_deref() {
        Some(encoded) if !encoded.is_empty() => {
            let raw: Vec<RawStep> = serde_json::from_str(&decode_base64(encoded)?)
                .map_err(|e| WorkflowError::malformed(format!("failed request body: {e}")))?;
            parse_history(&raw)?
        }
        _ => ParsedHistory::first_invocation(""),
    };

    let invoker = Invoker::from_headers(headers);
    if let Some(invoker) = &invoker {
        let result = InvokeResult {
            body: Some(message.clone()),
            is_failed: true,
            is_canceled: false,
        };
        notify_invoker(service.dispatcher().as_ref(), invoker, result).await?;
    }

    let workflow_url = headers.get(WORKFLOW_URL_HEADER).unwrap_or(url).to_string();
    let invocation = Invocation {
        failure_url: service.failure_url(&workflow_url),
        run_id: run_id.clone(),
        url: workflow_url,
        raw_payload: history.raw_initial_payload,
        headers: headers.user_headers(),
        steps: history.steps,
        retries: service.options().retries,
        flow_control: service.options().flow_control.clone(),
        invoker,
    };
    let context = WorkflowContext::new(
        Arc::new(invocation),
        Arc::clone(service.dispatcher()),
        ExecutionMode::FailureHandler,
    );
    warn!(workflow_run_id = %run_id, status = payload.status, message = %message, "running failure handler");
    failure_handler
        .on_failure(WorkflowFailure {
            context,
            status: payload.status,
            message,
            headers: payload.header,
        })
        .await?;
    Ok(Finish::new(run_id, FinishCondition::FailureCallback))
}

/// Deliver an invoked run's outcome to its parent as the invoke step's result.
pub(super) async fn notify_invoker(
    dispatcher: &dyn Dispatcher,
    invoker: &Invoker,
    result: InvokeResult,
) -> Result<(), WorkflowError> {
    let mut step = Step::new(invoker.step_id, invoker.step_name.clone(), StepType::Invoke);
    step.concurrent = invoker.concurrent;
    step.out = Some(
        serde_json::to_string(&result).map_err(|e| WorkflowError::malformed(format!("encode invoke result: {e}")))?,
    );
    let user_headers = Headers::new();
    let mut params = HeaderParams::new(&invoker.run_id, &invoker.url, &user_headers);
    params.step = Some(&step);
    let headers = workflow_headers(&params).headers;
    dispatcher
        .publish(PublishRequest::post(&invoker.url, headers, step.encode_body()?))
        .await?;
    info!(
        parent_run_id = %invoker.run_id,
        step_id = invoker.step_id,
        failed = result.is_failed,
        canceled = result.is_canceled,
        "invoke result sent to parent"
    );
    Ok(())
}
