//! Test helpers for engine tests
//!
//! Builders for delivered histories and continuation requests, a recording
//! counter for user functions, and a harness that plays the dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use stepwire::dispatcher::{DispatcherCall, PublishRequest, Termination};
use stepwire::history::RawStep;
use stepwire::protocol::{WORKFLOW_ID_HEADER, WORKFLOW_PROTOCOL_VERSION, WORKFLOW_PROTOCOL_VERSION_HEADER};
use stepwire::{
    Dispatcher, HttpRequest, HttpResponse, InMemoryDispatcher, Step, StepType, WorkflowHandler, WorkflowOptions,
    WorkflowService,
};

// ============================================================================
// Test Constants
// ============================================================================

pub const WORKFLOW_URL: &str = "https://app.test/api/workflow";
pub const RUN_ID: &str = "wfr_test";

// ============================================================================
// Step Builders
// ============================================================================

/// A recorded `Run` result.
pub fn result_step(id: u64, name: &str, out: &str) -> Step {
    let mut step = Step::new(id, name, StepType::Run);
    step.out = Some(out.to_string());
    step
}

/// A recorded result of any type.
pub fn typed_result(id: u64, name: &str, step_type: StepType, out: Option<&str>) -> Step {
    let mut step = Step::new(id, name, step_type);
    step.out = out.map(str::to_string);
    step
}

/// A `Run` plan step announcing `target` inside a group of `concurrent`.
pub fn plan_step(target: u64, name: &str, concurrent: usize) -> Step {
    let mut step = Step::new(0, name, StepType::Run);
    step.target_step = Some(target);
    step.concurrent = concurrent;
    step
}

/// Mark a result as produced inside a parallel group.
pub fn in_group(mut step: Step, concurrent: usize) -> Step {
    step.concurrent = concurrent;
    step
}

// ============================================================================
// Request Builders
// ============================================================================

/// Delivered history: the initial payload followed by `steps`, in order.
pub fn history(payload: &str, steps: &[Step]) -> Vec<RawStep> {
    let mut raw = vec![RawStep::step("msg-0", payload)];
    raw.extend(
        steps
            .iter()
            .enumerate()
            .map(|(i, step)| RawStep::step(format!("msg-{}", i + 1), &step.encode_body().unwrap())),
    );
    raw
}

/// Continuation request for `RUN_ID` carrying `raw` as its body.
pub fn continuation(raw: &[RawStep]) -> HttpRequest {
    HttpRequest::post(WORKFLOW_URL, serde_json::to_string(raw).unwrap())
        .header(WORKFLOW_ID_HEADER, RUN_ID)
        .header(WORKFLOW_PROTOCOL_VERSION_HEADER, WORKFLOW_PROTOCOL_VERSION)
}

/// Decode the step carried by a published continuation.
pub fn published_step(request: &PublishRequest) -> Step {
    serde_json::from_str(request.body.as_deref().unwrap()).unwrap()
}

pub fn body_json(response: &HttpResponse) -> serde_json::Value {
    response.body_json().unwrap()
}

pub fn finish_condition(response: &HttpResponse) -> String {
    body_json(response)["finishCondition"].as_str().unwrap_or_default().to_string()
}

pub fn service(handler: impl WorkflowHandler + 'static, dispatcher: &Arc<InMemoryDispatcher>) -> WorkflowService {
    let shared: Arc<dyn Dispatcher> = dispatcher.clone();
    WorkflowService::new(handler, shared, WorkflowOptions::default())
}

/// Output of the run's completion, if it completed.
pub async fn completed_output(dispatcher: &InMemoryDispatcher) -> Option<Option<String>> {
    dispatcher.calls().await.into_iter().find_map(|call| match call {
        DispatcherCall::Cancel {
            termination: Termination::Completed(output),
            ..
        } => Some(output),
        _ => None,
    })
}

// ============================================================================
// Call Counter
// ============================================================================

/// Counts executions of a user step function.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Plays the dispatcher: every published request becomes a history entry of
/// the run and is delivered back to the service, oldest first.
pub struct Harness {
    pub dispatcher: Arc<InMemoryDispatcher>,
    pub service: WorkflowService,
    pub history: Vec<RawStep>,
    pub responses: Vec<HttpResponse>,
    delivered: usize,
    next_message: usize,
}

impl Harness {
    pub fn new(handler: impl WorkflowHandler + 'static) -> Self {
        Self::with_options(handler, WorkflowOptions::default())
    }

    pub fn with_options(handler: impl WorkflowHandler + 'static, options: WorkflowOptions) -> Self {
        let dispatcher = Arc::new(InMemoryDispatcher::new());
        let shared: Arc<dyn Dispatcher> = dispatcher.clone();
        Self {
            service: WorkflowService::new(handler, shared, options),
            dispatcher,
            history: Vec::new(),
            responses: Vec::new(),
            delivered: 0,
            next_message: 0,
        }
    }

    /// First invocation: the payload arrives without protocol headers.
    pub async fn trigger(&mut self, payload: &str) -> HttpResponse {
        let response = self.service.handle(HttpRequest::post(WORKFLOW_URL, payload)).await;
        self.responses.push(response.clone());
        response
    }

    /// Deliver the oldest published request not delivered yet.
    pub async fn deliver_next(&mut self) -> Option<HttpResponse> {
        let published = self.dispatcher.published().await;
        let request = published.get(self.delivered)?.clone();
        self.delivered += 1;
        self.next_message += 1;
        let message_id = format!("msg-{}", self.next_message);
        self.history
            .push(RawStep::step(&message_id, request.body.as_deref().unwrap_or_default()));
        let delivery = InMemoryDispatcher::delivery(&request, &self.history, &message_id);
        let response = self.service.handle(delivery).await;
        self.responses.push(response.clone());
        Some(response)
    }

    /// Deliver until nothing is pending. Returns the number of deliveries.
    pub async fn drive(&mut self) -> usize {
        let mut count = 0;
        while self.deliver_next().await.is_some() {
            count += 1;
            assert!(count < 100, "run did not settle");
        }
        count
    }

    pub fn run_id(&self) -> String {
        self.responses
            .first()
            .map(|r| body_json(r)["workflowRunId"].as_str().unwrap_or_default().to_string())
            .unwrap_or_default()
    }
}
