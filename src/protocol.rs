//! Continuation protocol: the header set that travels with every dispatch
//! request so the next delivery can be correlated back to its run and step.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::step::{Step, StepType};

/// Seconds on the wire, rounded up so a sub-second delay never becomes zero.
pub fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

pub const WORKFLOW_PROTOCOL_VERSION: &str = "1";

pub const WORKFLOW_INIT_HEADER: &str = "Upstash-Workflow-Init";
pub const WORKFLOW_ID_HEADER: &str = "Upstash-Workflow-RunId";
pub const WORKFLOW_URL_HEADER: &str = "Upstash-Workflow-Url";
pub const WORKFLOW_FEATURE_HEADER: &str = "Upstash-Feature-Set";
pub const WORKFLOW_PROTOCOL_VERSION_HEADER: &str = "Upstash-Workflow-Sdk-Version";
pub const WORKFLOW_FAILURE_HEADER: &str = "Upstash-Workflow-Is-Failure";
pub const WORKFLOW_CALLBACK_HEADER: &str = "Upstash-Workflow-Callback";
pub const WORKFLOW_CALL_TYPE_HEADER: &str = "Upstash-Workflow-CallType";
pub const WORKFLOW_INVOKE_HEADER: &str = "Upstash-Workflow-Invoke";
pub const MESSAGE_ID_HEADER: &str = "Upstash-Message-Id";
pub const NON_RETRYABLE_ERROR_HEADER: &str = "Upstash-NonRetryable-Error";
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

pub const INVOKER_RUN_ID_HEADER: &str = "Upstash-Workflow-Invoker-RunId";
pub const INVOKER_URL_HEADER: &str = "Upstash-Workflow-Invoker-Url";
pub const INVOKER_STEP_ID_HEADER: &str = "Upstash-Workflow-Invoker-StepId";
pub const INVOKER_STEP_NAME_HEADER: &str = "Upstash-Workflow-Invoker-StepName";
pub const INVOKER_CONCURRENT_HEADER: &str = "Upstash-Workflow-Invoker-Concurrent";

pub const CALLBACK_STEP_ID_HEADER: &str = "Upstash-Workflow-StepId";
pub const CALLBACK_STEP_NAME_HEADER: &str = "Upstash-Workflow-StepName";
pub const CALLBACK_STEP_TYPE_HEADER: &str = "Upstash-Workflow-StepType";
pub const CALLBACK_CONCURRENT_HEADER: &str = "Upstash-Workflow-Concurrent";
pub const CALLBACK_CONTENT_TYPE_HEADER: &str = "Upstash-Workflow-ContentType";

pub const DEFAULT_FEATURES: &str = "LazyFetch,InitialBody";
pub const CALL_FEATURES: &str = "WF_NoDelete,InitialBody";
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

pub(crate) const FORWARD_PREFIX: &str = "Upstash-Forward-";
const FAILURE_PREFIX: &str = "Upstash-Failure-Callback";
const CALLBACK_FAILURE_PREFIX: &str = "Upstash-Callback-Failure-Callback";

// Inbound headers that belong to the transport rather than to the user.
const DROPPED_USER_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "accept-encoding",
    "user-agent",
];

/// Case-insensitive header map that keeps the original spelling for output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, (String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.insert(name.to_ascii_lowercase(), (name, value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&name.to_ascii_lowercase()).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate as `(name, value)` in the spelling they were inserted with.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.values().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn extend(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }

    /// Headers the user sent with the triggering request, without the
    /// dispatcher's own `Upstash-*` metadata.
    pub fn user_headers(&self) -> Headers {
        let mut out = Headers::new();
        for (name, value) in self.iter() {
            let lowered = name.to_ascii_lowercase();
            if lowered.starts_with("upstash-") || DROPPED_USER_HEADERS.contains(&lowered.as_str()) {
                continue;
            }
            out.insert(name, value);
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Dispatcher-side concurrency and rate limiting for a group of requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControl {
    pub key: String,
    pub parallelism: Option<u32>,
    pub rate: Option<u32>,
    pub period: Option<Duration>,
}

impl FlowControl {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            parallelism: None,
            rate: None,
            period: None,
        }
    }

    pub fn parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn rate(mut self, rate: u32) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    /// `parallelism=N, rate=M, period=Ps`, omitting unset parts.
    pub fn header_value(&self) -> String {
        let mut parts = Vec::new();
        if let Some(p) = self.parallelism {
            parts.push(format!("parallelism={p}"));
        }
        if let Some(r) = self.rate {
            parts.push(format!("rate={r}"));
        }
        if let Some(period) = self.period {
            parts.push(format!("period={}s", whole_seconds(period)));
        }
        parts.join(", ")
    }

    fn write(&self, headers: &mut Headers, prefix: &str) {
        headers.insert(format!("{prefix}Flow-Control-Key"), self.key.clone());
        headers.insert(format!("{prefix}Flow-Control-Value"), self.header_value());
    }
}

/// Identifies the parent run when this workflow was started by `invoke`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoker {
    pub run_id: String,
    pub url: String,
    pub step_id: u64,
    pub step_name: String,
    pub concurrent: usize,
}

impl Invoker {
    /// Read the forwarded invoker headers of an inbound request.
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let run_id = headers.get(INVOKER_RUN_ID_HEADER)?.to_string();
        let url = headers.get(INVOKER_URL_HEADER)?.to_string();
        let step_id = headers.get(INVOKER_STEP_ID_HEADER)?.parse().ok()?;
        let step_name = headers.get(INVOKER_STEP_NAME_HEADER).unwrap_or_default().to_string();
        let concurrent = headers
            .get(INVOKER_CONCURRENT_HEADER)
            .and_then(|c| c.parse().ok())
            .unwrap_or(1);
        Some(Self {
            run_id,
            url,
            step_id,
            step_name,
            concurrent,
        })
    }

    fn write_forwarded(&self, headers: &mut Headers, prefix: &str) {
        headers.insert(format!("{prefix}{INVOKER_RUN_ID_HEADER}"), self.run_id.clone());
        headers.insert(format!("{prefix}{INVOKER_URL_HEADER}"), self.url.clone());
        headers.insert(format!("{prefix}{INVOKER_STEP_ID_HEADER}"), self.step_id.to_string());
        headers.insert(format!("{prefix}{INVOKER_STEP_NAME_HEADER}"), self.step_name.clone());
        headers.insert(format!("{prefix}{INVOKER_CONCURRENT_HEADER}"), self.concurrent.to_string());
    }
}

/// Per-step overrides declared on a call or invoke step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOverrides {
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub flow_control: Option<FlowControl>,
}

/// Inputs for one continuation header set.
#[derive(Debug, Clone)]
pub struct HeaderParams<'a> {
    pub init: bool,
    pub run_id: &'a str,
    pub workflow_url: &'a str,
    pub user_headers: &'a Headers,
    pub failure_url: Option<&'a str>,
    pub retries: Option<u32>,
    pub flow_control: Option<&'a FlowControl>,
    pub invoker: Option<&'a Invoker>,
    pub step: Option<&'a Step>,
    pub overrides: Option<&'a StepOverrides>,
}

impl<'a> HeaderParams<'a> {
    pub fn new(run_id: &'a str, workflow_url: &'a str, user_headers: &'a Headers) -> Self {
        Self {
            init: false,
            run_id,
            workflow_url,
            user_headers,
            failure_url: None,
            retries: None,
            flow_control: None,
            invoker: None,
            step: None,
            overrides: None,
        }
    }
}

/// Headers for one outbound request, plus the separate set the dispatcher
/// uses for its own timeout request when the step is a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowHeaders {
    pub headers: Headers,
    pub timeout_headers: Option<Headers>,
}

/// Resolve the content type: call headers, then user headers, then JSON.
pub fn resolve_content_type(call_headers: Option<&BTreeMap<String, String>>, user_headers: &Headers) -> String {
    call_headers
        .and_then(|h| {
            h.iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                .map(|(_, value)| value.clone())
        })
        .or_else(|| user_headers.get("Content-Type").map(str::to_string))
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

/// Build the continuation headers for one request.
pub fn workflow_headers(params: &HeaderParams<'_>) -> WorkflowHeaders {
    let step = params.step;
    let is_call = step.is_some_and(|s| s.call_url.is_some());
    let step_retries = params.overrides.and_then(|o| o.retries);
    let step_timeout = params.overrides.and_then(|o| o.timeout);
    let step_flow_control = params.overrides.and_then(|o| o.flow_control.as_ref());

    let mut headers = Headers::new();
    headers.insert(WORKFLOW_INIT_HEADER, if params.init { "true" } else { "false" });
    headers.insert(WORKFLOW_ID_HEADER, params.run_id);
    headers.insert(WORKFLOW_URL_HEADER, params.workflow_url);
    headers.insert(WORKFLOW_FEATURE_HEADER, DEFAULT_FEATURES);
    headers.insert(WORKFLOW_PROTOCOL_VERSION_HEADER, WORKFLOW_PROTOCOL_VERSION);
    if !is_call {
        headers.insert(
            format!("{FORWARD_PREFIX}{WORKFLOW_PROTOCOL_VERSION_HEADER}"),
            WORKFLOW_PROTOCOL_VERSION,
        );
    }
    if let Some(timeout) = step_timeout {
        headers.insert("Upstash-Timeout", format!("{}s", whole_seconds(timeout)));
    }
    if let Some(invoker) = params.invoker {
        invoker.write_forwarded(&mut headers, FORWARD_PREFIX);
    }

    if let Some(failure_url) = params.failure_url {
        // A call's failure must reach the workflow through the callback, so the
        // failure-callback metadata is nested one level deeper.
        let prefix = if is_call { CALLBACK_FAILURE_PREFIX } else { FAILURE_PREFIX };
        write_failure_headers(&mut headers, prefix, failure_url, params);
    }

    if is_call {
        headers.insert("Upstash-Retries", step_retries.unwrap_or(0).to_string());
        headers.insert(WORKFLOW_FEATURE_HEADER, CALL_FEATURES);
        if let Some(retries) = params.retries {
            headers.insert("Upstash-Callback-Retries", retries.to_string());
        }
        if let Some(fc) = step_flow_control {
            fc.write(&mut headers, "Upstash-");
        }
        if let Some(fc) = params.flow_control {
            fc.write(&mut headers, "Upstash-Callback-");
        }
    } else {
        if let Some(fc) = step_flow_control.or(params.flow_control) {
            fc.write(&mut headers, "Upstash-");
        }
        if let Some(retries) = step_retries.or(params.retries) {
            headers.insert("Upstash-Retries", retries.to_string());
        }
    }

    for (name, value) in params.user_headers.iter() {
        if is_call {
            headers.insert(format!("Upstash-Callback-Forward-{name}"), value);
        } else {
            headers.insert(format!("{FORWARD_PREFIX}{name}"), value);
        }
    }

    if let Some(step) = step.filter(|_| is_call) {
        return WorkflowHeaders {
            headers: call_headers(headers, step, params),
            timeout_headers: None,
        };
    }

    if step.is_some_and(|s| matches!(s.step_type, StepType::Wait | StepType::WaitForWebhook) && s.step_id != 0) {
        let mut timeout_headers = headers.clone();
        timeout_headers.insert("Upstash-Workflow-Runid", params.run_id);
        timeout_headers.insert(WORKFLOW_INIT_HEADER, "false");
        timeout_headers.insert(WORKFLOW_URL_HEADER, params.workflow_url);
        timeout_headers.insert(WORKFLOW_CALL_TYPE_HEADER, "step");
        return WorkflowHeaders {
            headers,
            timeout_headers: Some(timeout_headers),
        };
    }

    WorkflowHeaders {
        headers,
        timeout_headers: None,
    }
}

fn write_failure_headers(headers: &mut Headers, prefix: &str, failure_url: &str, params: &HeaderParams<'_>) {
    headers.insert(prefix, failure_url);
    headers.insert(format!("{prefix}-Forward-{WORKFLOW_FAILURE_HEADER}"), "true");
    headers.insert(format!("{prefix}-Forward-Upstash-Workflow-Failure-Callback"), "true");
    headers.insert(format!("{prefix}-Workflow-Runid"), params.run_id);
    headers.insert(format!("{prefix}-Workflow-Init"), "false");
    headers.insert(format!("{prefix}-Workflow-Url"), params.workflow_url);
    headers.insert(format!("{prefix}-Workflow-Calltype"), "failureCall");
    if let Some(retries) = params.retries {
        headers.insert(format!("{prefix}-Retries"), retries.to_string());
    }
    if let Some(fc) = params.flow_control {
        fc.write(headers, &format!("{prefix}-"));
    }
    for (name, value) in params.user_headers.iter() {
        headers.insert(format!("{prefix}-Forward-{name}"), value);
    }
    // A failed child still owes its parent an invoke result.
    if let Some(invoker) = params.invoker {
        invoker.write_forwarded(headers, &format!("{prefix}-Forward-"));
    }
}

// Headers for a call routed through a third-party URL: the third party sees
// the call headers, the dispatcher relays its answer back via the callback.
fn call_headers(mut headers: Headers, step: &Step, params: &HeaderParams<'_>) -> Headers {
    if let Some(call_headers) = &step.call_headers {
        for (name, value) in call_headers {
            headers.insert(format!("{FORWARD_PREFIX}{name}"), value.clone());
        }
    }
    let content_type = resolve_content_type(step.call_headers.as_ref(), params.user_headers);
    headers.insert("Upstash-Callback", params.workflow_url);
    headers.insert("Upstash-Callback-Workflow-RunId", params.run_id);
    headers.insert("Upstash-Callback-Workflow-CallType", "fromCallback");
    headers.insert("Upstash-Callback-Workflow-Init", "false");
    headers.insert("Upstash-Callback-Workflow-Url", params.workflow_url);
    headers.insert("Upstash-Callback-Feature-Set", DEFAULT_FEATURES);
    headers.insert(
        format!("Upstash-Callback-Forward-{WORKFLOW_PROTOCOL_VERSION_HEADER}"),
        WORKFLOW_PROTOCOL_VERSION,
    );
    headers.insert(format!("Upstash-Callback-Forward-{WORKFLOW_CALLBACK_HEADER}"), "true");
    headers.insert(
        format!("Upstash-Callback-Forward-{CALLBACK_STEP_ID_HEADER}"),
        step.step_id.to_string(),
    );
    headers.insert(
        format!("Upstash-Callback-Forward-{CALLBACK_STEP_NAME_HEADER}"),
        step.step_name.clone(),
    );
    headers.insert(
        format!("Upstash-Callback-Forward-{CALLBACK_STEP_TYPE_HEADER}"),
        step.step_type.as_str(),
    );
    headers.insert(
        format!("Upstash-Callback-Forward-{CALLBACK_CONCURRENT_HEADER}"),
        step.concurrent.to_string(),
    );
    headers.insert(
        format!("Upstash-Callback-Forward-{CALLBACK_CONTENT_TYPE_HEADER}"),
        content_type,
    );
    if let Some(invoker) = params.invoker {
        for (name, value) in [
            (INVOKER_RUN_ID_HEADER, invoker.run_id.clone()),
            (INVOKER_URL_HEADER, invoker.url.clone()),
            (INVOKER_STEP_ID_HEADER, invoker.step_id.to_string()),
            (INVOKER_STEP_NAME_HEADER, invoker.step_name.clone()),
            (INVOKER_CONCURRENT_HEADER, invoker.concurrent.to_string()),
        ] {
            headers.remove(&format!("{FORWARD_PREFIX}{name}"));
            headers.insert(format!("Upstash-Callback-Forward-{name}"), value);
        }
    }
    headers.insert(WORKFLOW_CALL_TYPE_HEADER, "toCallback");
    headers
}

/// Inbound protocol-version check. `Ok(true)` means a first invocation.
pub fn check_protocol_version(headers: &Headers) -> Result<bool, ProtocolMismatch> {
    match headers.get(WORKFLOW_PROTOCOL_VERSION_HEADER) {
        None => Ok(true),
        Some(WORKFLOW_PROTOCOL_VERSION) => Ok(false),
        Some(other) => Err(ProtocolMismatch {
            found: other.to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMismatch {
    pub found: String,
}

impl fmt::Display for ProtocolMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "incompatible workflow sdk protocol version. Expected {WORKFLOW_PROTOCOL_VERSION}, got {} from the request",
            self.found
        )
    }
}
