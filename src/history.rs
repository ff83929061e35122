//! Turns the raw per-invocation body into an ordered, duplicate-free step
//! history.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::error::WorkflowError;
use crate::step::{Step, decode_base64, encode_base64};

/// Call type of a delivered history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    #[serde(rename = "step")]
    Step,
    #[serde(rename = "toCallback")]
    ToCallback,
    #[serde(rename = "fromCallback")]
    FromCallback,
    #[serde(rename = "failureCall")]
    FailureCall,
}

/// One entry of the history array the dispatcher delivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStep {
    pub message_id: String,
    /// Base64 of the request body that produced this entry.
    pub body: String,
    pub call_type: CallType,
}

impl RawStep {
    /// A `step` entry whose body is `request_body` as published.
    pub fn step(message_id: impl Into<String>, request_body: &str) -> Self {
        Self {
            message_id: message_id.into(),
            body: encode_base64(request_body),
            call_type: CallType::Step,
        }
    }
}

/// Outcome of parsing one inbound request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHistory {
    /// Starts with the synthetic initial step.
    pub steps: Vec<Step>,
    /// The delivery is a stale redelivery of an already recorded entry.
    pub is_duplicate: bool,
    pub raw_initial_payload: String,
    /// History could not be fetched because the run is already over.
    pub run_ended: bool,
}

impl ParsedHistory {
    /// History for a first invocation: the body is the payload itself.
    pub fn first_invocation(raw_payload: impl Into<String>) -> Self {
        let raw = raw_payload.into();
        Self {
            steps: vec![Step::initial(raw.clone())],
            is_duplicate: false,
            raw_initial_payload: raw,
            run_ended: false,
        }
    }

    fn ended() -> Self {
        Self {
            steps: Vec::new(),
            is_duplicate: false,
            raw_initial_payload: String::new(),
            run_ended: true,
        }
    }
}

/// Decode the delivered history array.
///
/// Callback legs are dropped; the first entry carries the initial payload.
pub fn process_raw_steps(raw_steps: &[RawStep]) -> Result<(String, Vec<Step>), WorkflowError> {
    let Some((first, rest)) = raw_steps.split_first() else {
        return Ok((String::new(), vec![Step::initial("")]));
    };
    let raw_initial_payload = decode_base64(&first.body)?;
    let mut steps = Vec::with_capacity(raw_steps.len());
    steps.push(Step::initial(raw_initial_payload.clone()));
    for raw in rest.iter().filter(|raw| raw.call_type == CallType::Step) {
        steps.push(Step::decode_entry(&raw.body)?);
    }
    Ok((raw_initial_payload, steps))
}

/// True when the last entry repeats the `(step_id, target_step)` of an earlier one.
pub fn is_last_duplicate(steps: &[Step]) -> bool {
    let Some((last, earlier)) = steps.split_last() else {
        return false;
    };
    let identity = last.identity();
    earlier.iter().any(|step| step.identity() == identity)
}

/// Keep the first result per `step_id` and the first plan per `target_step`.
pub fn deduplicate_steps(steps: Vec<Step>) -> Vec<Step> {
    let mut step_ids = HashSet::new();
    let mut target_steps = HashSet::new();
    steps
        .into_iter()
        .filter(|step| {
            if step.step_id == 0 {
                target_steps.insert(step.target_step.unwrap_or(0))
            } else {
                step_ids.insert(step.step_id)
            }
        })
        .collect()
}

/// Parse an already materialized history array.
pub fn parse_history(raw_steps: &[RawStep]) -> Result<ParsedHistory, WorkflowError> {
    let (raw_initial_payload, steps) = process_raw_steps(raw_steps)?;
    let is_duplicate = is_last_duplicate(&steps);
    let steps = deduplicate_steps(steps);
    Ok(ParsedHistory {
        steps,
        is_duplicate,
        raw_initial_payload,
        run_ended: false,
    })
}

/// Parse an inbound request body for a continuation delivery.
///
/// An empty body means the dispatcher left the history out; it is fetched by
/// run id and cut at the delivering message. Only a fetch that reports the run
/// as gone ends it; other failures propagate so the delivery is retried.
pub async fn parse_request(
    body: &str,
    run_id: &str,
    message_id: Option<&str>,
    dispatcher: &dyn Dispatcher,
) -> Result<ParsedHistory, WorkflowError> {
    let raw_steps: Vec<RawStep> = if body.trim().is_empty() {
        match dispatcher.fetch_history(run_id).await {
            Ok(steps) => truncate_at_message(steps, message_id),
            Err(e) if e.is_run_ended() => {
                warn!(workflow_run_id = %run_id, error = %e, "history is gone, treating run as ended");
                return Ok(ParsedHistory::ended());
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        serde_json::from_str(body).map_err(|e| WorkflowError::malformed(format!("history body: {e}")))?
    };
    let parsed = parse_history(&raw_steps)?;
    debug!(
        workflow_run_id = %run_id,
        entries = parsed.steps.len(),
        duplicate = parsed.is_duplicate,
        "parsed history"
    );
    Ok(parsed)
}

/// Body of the delivered message `message_id`, fetched when the dispatcher
/// left it out of the request. `None` when the run is already over.
pub async fn fetch_entry_body(
    run_id: &str,
    message_id: Option<&str>,
    dispatcher: &dyn Dispatcher,
) -> Result<Option<String>, WorkflowError> {
    let Some(message_id) = message_id else {
        return Err(WorkflowError::malformed("empty body without a message id to fetch it by"));
    };
    let steps = match dispatcher.fetch_history(run_id).await {
        Ok(steps) => steps,
        Err(e) if e.is_run_ended() => {
            warn!(workflow_run_id = %run_id, error = %e, "history is gone, treating run as ended");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let entry = steps
        .iter()
        .find(|s| s.message_id == message_id)
        .ok_or_else(|| WorkflowError::malformed(format!("message {message_id} is not in the run history")))?;
    decode_base64(&entry.body).map(Some)
}

fn truncate_at_message(mut steps: Vec<RawStep>, message_id: Option<&str>) -> Vec<RawStep> {
    if let Some(index) = message_id.and_then(|id| steps.iter().position(|s| s.message_id == id)) {
        steps.truncate(index + 1);
    }
    steps
}
