//! Wire and history representation of a single unit of work.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ConfigErrorKind, WorkflowError};

/// Kinds of steps a workflow can declare, plus the synthetic initial step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepType {
    Initial,
    Run,
    SleepFor,
    SleepUntil,
    Call,
    Wait,
    Notify,
    Invoke,
    CreateWebhook,
    WaitForWebhook,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Initial => "Initial",
            StepType::Run => "Run",
            StepType::SleepFor => "SleepFor",
            StepType::SleepUntil => "SleepUntil",
            StepType::Call => "Call",
            StepType::Wait => "Wait",
            StepType::Notify => "Notify",
            StepType::Invoke => "Invoke",
            StepType::CreateWebhook => "CreateWebhook",
            StepType::WaitForWebhook => "WaitForWebhook",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "Initial" => StepType::Initial,
            "Run" => StepType::Run,
            "SleepFor" => StepType::SleepFor,
            "SleepUntil" => StepType::SleepUntil,
            "Call" => StepType::Call,
            "Wait" => StepType::Wait,
            "Notify" => StepType::Notify,
            "Invoke" => StepType::Invoke,
            "CreateWebhook" => StepType::CreateWebhook,
            "WaitForWebhook" => StepType::WaitForWebhook,
            other => return Err(WorkflowError::malformed(format!("unknown step type '{other}'"))),
        };
        Ok(ty)
    }
}

/// One history record: either a plan step (`step_id == 0`, `target_step` set)
/// or a result step (`step_id > 0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub step_id: u64,
    pub step_name: String,
    pub step_type: StepType,
    #[serde(default, deserialize_with = "deserialize_out", skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrent: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_step: Option<u64>,

    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_for: Option<u64>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_headers: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_event_id: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Set by the dispatcher when a wait resolved through its timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_timeout: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_headers: Option<BTreeMap<String, String>>,
}

fn default_concurrency() -> usize {
    1
}

// Dispatcher-produced results (call responses, wait payloads) may arrive as
// JSON values instead of strings; keep them as their JSON text.
fn deserialize_out<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Reject empty step names before any work is attempted.
pub fn validate_step_name(name: &str) -> Result<(), WorkflowError> {
    if name.trim().is_empty() {
        return Err(WorkflowError::configuration(
            ConfigErrorKind::EmptyStepName,
            "a workflow step name cannot be empty",
        ));
    }
    Ok(())
}

impl Step {
    /// Bare record with every kind-specific field unset.
    pub fn new(step_id: u64, step_name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            step_id,
            step_name: step_name.into(),
            step_type,
            out: None,
            concurrent: 1,
            target_step: None,
            sleep_for: None,
            sleep_until: None,
            call_url: None,
            call_method: None,
            call_body: None,
            call_headers: None,
            wait_event_id: None,
            timeout: None,
            wait_timeout: None,
            invoke_url: None,
            invoke_body: None,
            invoke_headers: None,
        }
    }

    /// The synthetic first history entry carrying the raw initial payload.
    pub fn initial(raw_payload: impl Into<String>) -> Self {
        let mut step = Self::new(0, "init", StepType::Initial);
        step.out = Some(raw_payload.into());
        step
    }

    pub fn is_plan(&self) -> bool {
        self.step_id == 0 && self.target_step.is_some()
    }

    /// Position in the run this record refers to (`target_step` for plans).
    pub fn position(&self) -> u64 {
        match self.target_step {
            Some(target) if self.step_id == 0 => target,
            _ => self.step_id,
        }
    }

    /// Key used for duplicate detection.
    pub fn identity(&self) -> (u64, u64) {
        (self.step_id, self.target_step.unwrap_or(0))
    }

    /// JSON body of an outbound continuation request.
    pub fn encode_body(&self) -> Result<String, WorkflowError> {
        serde_json::to_string(self).map_err(|e| WorkflowError::malformed(format!("encode step '{}': {e}", self.step_name)))
    }

    /// Decode a base64 history entry body.
    pub fn decode_entry(encoded: &str) -> Result<Self, WorkflowError> {
        let text = decode_base64(encoded)?;
        let mut step: Step =
            serde_json::from_str(&text).map_err(|e| WorkflowError::malformed(format!("decode step entry: {e}")))?;
        step.normalize_wait_result();
        Ok(step)
    }

    // Wait results arrive as base64 event data plus a timeout flag.
    fn normalize_wait_result(&mut self) {
        if self.wait_event_id.is_none() || self.step_id == 0 {
            return;
        }
        let event_data = match self.out.as_deref() {
            Some(raw) if !raw.is_empty() => Some(decode_base64(raw).unwrap_or_else(|_| raw.to_string())),
            _ => None,
        };
        let normalized = serde_json::json!({
            "eventData": event_data,
            "timeout": self.wait_timeout.unwrap_or(false),
        });
        self.out = Some(normalized.to_string());
    }
}

pub(crate) fn decode_base64(encoded: &str) -> Result<String, WorkflowError> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| WorkflowError::malformed(format!("invalid base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| WorkflowError::malformed(format!("history entry is not utf-8: {e}")))
}

pub(crate) fn encode_base64(raw: &str) -> String {
    general_purpose::STANDARD.encode(raw.as_bytes())
}
