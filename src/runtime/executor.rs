//! Replay vs. execute decisions and the parallel fan-out/fan-in state machine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, PublishRequest, WaitRequest};
use crate::error::{ConfigErrorKind, Interrupt, StepResult, SuspendReason, Suspension, WorkflowError};
use crate::lazy::{LazyStep, StepEnv};
use crate::protocol::{FlowControl, HeaderParams, Headers, Invoker, StepOverrides, workflow_headers};
use crate::step::{Step, StepType};

/// Everything reconstructed from one inbound request. Immutable for the
/// lifetime of the invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub run_id: String,
    pub url: String,
    pub failure_url: Option<String>,
    pub raw_payload: String,
    /// User headers of the triggering request.
    pub headers: Headers,
    /// Deduplicated history, starting with the initial step.
    pub steps: Vec<Step>,
    pub retries: Option<u32>,
    pub flow_control: Option<FlowControl>,
    pub invoker: Option<Invoker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Live,
    /// Every step declaration raises the auth-probe signal.
    AuthProbe,
    /// Running a failure handler; steps are not allowed.
    FailureHandler,
}

/// Where a parallel group stands, derived from history alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelState {
    /// Nothing recorded yet: announce the group.
    First,
    /// Last entry is a plan step of this group: run that one branch.
    Partial,
    /// A sibling already answered this delivery.
    Discard,
    /// Every branch has a plan and a result.
    Last,
}

/// Classify a parallel group of `concurrency` steps starting at position `initial`.
pub fn parallel_state(steps: &[Step], concurrency: usize, initial: u64) -> ParallelState {
    let remaining: Vec<&Step> = steps.iter().filter(|s| s.position() >= initial).collect();
    match remaining.last() {
        None => ParallelState::First,
        Some(_) if remaining.len() >= 2 * concurrency => ParallelState::Last,
        Some(last) if last.is_plan() => ParallelState::Partial,
        Some(_) => ParallelState::Discard,
    }
}

#[derive(Debug, Default)]
struct ExecState {
    step_count: u64,
    in_flight: bool,
    interrupt: Option<Interrupt>,
}

struct Submission {
    step: Step,
    overrides: StepOverrides,
}

/// Drives step declarations of one invocation.
pub struct Executor {
    invocation: Arc<Invocation>,
    dispatcher: Arc<dyn Dispatcher>,
    mode: ExecutionMode,
    state: Mutex<ExecState>,
}

struct InFlightGuard<'a> {
    executor: &'a Executor,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.executor.lock().in_flight = false;
    }
}

impl Executor {
    pub fn new(invocation: Arc<Invocation>, dispatcher: Arc<dyn Dispatcher>, mode: ExecutionMode) -> Self {
        Self {
            invocation,
            dispatcher,
            mode,
            state: Mutex::new(ExecState::default()),
        }
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub(crate) fn shared_invocation(&self) -> Arc<Invocation> {
        Arc::clone(&self.invocation)
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Number of step positions consumed so far.
    pub fn step_count(&self) -> u64 {
        self.lock().step_count
    }

    /// The interrupt that ended this invocation, even if user code swallowed it.
    pub fn recorded_interrupt(&self) -> Option<Interrupt> {
        self.lock().interrupt.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ExecState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, interrupt: Interrupt) -> Interrupt {
        let mut state = self.lock();
        state.interrupt.get_or_insert(interrupt).clone()
    }

    fn enter(&self, name: &str) -> StepResult<InFlightGuard<'_>> {
        let mut state = self.lock();
        if state.in_flight {
            let err = WorkflowError::configuration(
                ConfigErrorKind::NestedStep,
                format!("step '{name}' was declared while another step was running; steps cannot be nested"),
            );
            let interrupt = Interrupt::Failed(err);
            state.interrupt.get_or_insert(interrupt.clone());
            return Err(interrupt);
        }
        state.in_flight = true;
        Ok(InFlightGuard { executor: self })
    }

    /// Request cancellation of the run.
    pub fn cancel(&self) -> StepResult<()> {
        let interrupt = match self.mode {
            ExecutionMode::AuthProbe => Interrupt::AuthProbe,
            ExecutionMode::FailureHandler => Interrupt::Failed(step_in_failure_handler("cancel")),
            ExecutionMode::Live => Interrupt::Cancelled,
        };
        Err(self.record(interrupt))
    }

    /// Declare one step (sequential) or several (one parallel group).
    ///
    /// Returns the recorded outputs in declaration order, or the interrupt
    /// that ends this invocation.
    pub async fn add_steps(&self, steps: Vec<LazyStep>) -> StepResult<Vec<Option<String>>> {
        if let Some(interrupt) = self.recorded_interrupt() {
            return Err(interrupt);
        }
        let Some(first) = steps.first() else {
            return Ok(Vec::new());
        };
        match self.mode {
            ExecutionMode::Live => {}
            ExecutionMode::AuthProbe => return Err(self.record(Interrupt::AuthProbe)),
            ExecutionMode::FailureHandler => {
                return Err(self.record(Interrupt::Failed(step_in_failure_handler(first.step_name()))));
            }
        }

        let guard = self.enter(first.step_name())?;
        let result = if steps.len() == 1 {
            match steps.into_iter().next() {
                Some(step) => self.run_single(step).await.map(|out| vec![out]),
                None => Ok(Vec::new()),
            }
        } else {
            self.run_parallel(steps).await
        };
        drop(guard);

        // A nested declaration inside a running step fails the outer step too.
        if let Some(interrupt) = self.recorded_interrupt() {
            return Err(interrupt);
        }
        result.map_err(|interrupt| self.record(interrupt))
    }

    async fn run_single(&self, lazy: LazyStep) -> StepResult<Option<String>> {
        let position = {
            let mut state = self.lock();
            state.step_count += 1;
            state.step_count
        };

        if let Some(recorded) = self.result_at(position) {
            validate_step(&lazy, recorded)?;
            debug!(
                workflow_run_id = %self.invocation.run_id,
                step_id = position,
                step_name = %recorded.step_name,
                "replaying step"
            );
            return Ok(recorded.out.clone());
        }

        let overrides = lazy.overrides();
        let name = lazy.step_name().to_string();
        let step = lazy.result_step(1, position, &self.env()).await?;
        info!(
            workflow_run_id = %self.invocation.run_id,
            step_id = position,
            step_name = %name,
            step_type = %step.step_type,
            "submitting step"
        );
        let suspension = self
            .submit(vec![Submission { step, overrides }], SuspendReason::StepSubmitted)
            .await?;
        Err(Interrupt::Suspended(suspension))
    }

    async fn run_parallel(&self, steps: Vec<LazyStep>) -> StepResult<Vec<Option<String>>> {
        let concurrency = steps.len();
        let initial = {
            let mut state = self.lock();
            let initial = state.step_count + 1;
            state.step_count += concurrency as u64;
            initial
        };
        let state = parallel_state(&self.invocation.steps, concurrency, initial);
        debug!(
            workflow_run_id = %self.invocation.run_id,
            initial_step = initial,
            concurrency,
            state = ?state,
            "parallel group"
        );

        match state {
            ParallelState::First => {
                let plans = steps
                    .iter()
                    .zip(initial..)
                    .map(|(lazy, target)| Submission {
                        step: lazy.plan_step(concurrency, target),
                        overrides: lazy.overrides(),
                    })
                    .collect();
                let suspension = self.submit(plans, SuspendReason::PlanSubmitted).await?;
                Err(Interrupt::Suspended(suspension))
            }
            ParallelState::Partial => {
                let plan = self
                    .invocation
                    .steps
                    .last()
                    .ok_or_else(|| WorkflowError::malformed("partial parallel state without a plan step"))?;
                let target = plan.target_step.unwrap_or(0);
                let index = target
                    .checked_sub(initial)
                    .map(|i| i as usize)
                    .filter(|i| *i < concurrency)
                    .ok_or_else(|| WorkflowError::Nondeterminism {
                        position: target,
                        expected: format!("a step of the parallel group {initial}..{}", initial + concurrency as u64),
                        found: describe(&plan.step_name, plan.step_type),
                    })?;
                let lazy = steps
                    .into_iter()
                    .nth(index)
                    .ok_or_else(|| WorkflowError::malformed("parallel step index out of range"))?;
                validate_step(&lazy, plan)?;
                let overrides = lazy.overrides();
                let step = lazy.result_step(concurrency, target, &self.env()).await?;
                info!(
                    workflow_run_id = %self.invocation.run_id,
                    step_id = target,
                    step_name = %step.step_name,
                    concurrency,
                    "submitting parallel branch"
                );
                let suspension = self
                    .submit(vec![Submission { step, overrides }], SuspendReason::StepSubmitted)
                    .await?;
                Err(Interrupt::Suspended(suspension))
            }
            ParallelState::Discard => {
                warn!(
                    workflow_run_id = %self.invocation.run_id,
                    initial_step = initial,
                    concurrency,
                    "discarding parallel delivery; a sibling branch already responded"
                );
                Err(Interrupt::Suspended(Suspension {
                    step_name: steps.first().map(|s| s.step_name().to_string()).unwrap_or_default(),
                    position: initial,
                    reason: SuspendReason::BranchDiscarded,
                    message_ids: Vec::new(),
                }))
            }
            ParallelState::Last => {
                let mut outs = Vec::with_capacity(concurrency);
                for (lazy, position) in steps.iter().zip(initial..) {
                    let recorded = self.result_at(position).ok_or_else(|| {
                        WorkflowError::malformed(format!("parallel group is complete but step {position} has no result"))
                    })?;
                    validate_step(lazy, recorded)?;
                    outs.push(recorded.out.clone());
                }
                debug!(
                    workflow_run_id = %self.invocation.run_id,
                    initial_step = initial,
                    concurrency,
                    "replaying parallel group"
                );
                Ok(outs)
            }
        }
    }

    fn result_at(&self, position: u64) -> Option<&Step> {
        self.invocation
            .steps
            .iter()
            .find(|s| s.step_id == position && s.step_id != 0)
    }

    fn env(&self) -> StepEnv<'_> {
        StepEnv {
            dispatcher: self.dispatcher.as_ref(),
            run_id: &self.invocation.run_id,
        }
    }

    fn header_params<'a>(&'a self, step: &'a Step, overrides: &'a StepOverrides) -> HeaderParams<'a> {
        let inv = &self.invocation;
        HeaderParams {
            init: false,
            run_id: &inv.run_id,
            workflow_url: &inv.url,
            user_headers: &inv.headers,
            failure_url: inv.failure_url.as_deref(),
            retries: inv.retries,
            flow_control: inv.flow_control.as_ref(),
            invoker: inv.invoker.as_ref(),
            step: Some(step),
            overrides: Some(overrides),
        }
    }

    /// Outbound request continuing this run with `sub`.
    fn continuation_request(&self, sub: &Submission) -> Result<PublishRequest, WorkflowError> {
        let step = &sub.step;
        let headers = workflow_headers(&self.header_params(step, &sub.overrides)).headers;
        if let (Some(url), false) = (&step.call_url, step.is_plan()) {
            return Ok(PublishRequest {
                url: url.clone(),
                method: step.call_method.clone().unwrap_or_else(|| "POST".to_string()),
                headers,
                body: step.call_body.clone(),
                delay: None,
                not_before: None,
            });
        }
        // Inside a parallel group the delay rides on the plan step.
        let schedules = step.is_plan() || step.concurrent <= 1;
        let mut request = PublishRequest::post(&self.invocation.url, headers, step.encode_body()?);
        if schedules {
            request.delay = step.sleep_for.map(Duration::from_secs);
            request.not_before = step.sleep_until;
        }
        Ok(request)
    }

    async fn submit(&self, mut submissions: Vec<Submission>, reason: SuspendReason) -> Result<Suspension, WorkflowError> {
        let Some(first) = submissions.first() else {
            return Err(WorkflowError::malformed("no steps to submit"));
        };
        let mut suspension = Suspension {
            step_name: first.step.step_name.clone(),
            position: first.step.position(),
            reason,
            message_ids: Vec::new(),
        };

        if submissions.len() > 1 {
            let requests = submissions
                .iter()
                .map(|sub| self.continuation_request(sub))
                .collect::<Result<Vec<_>, _>>()?;
            let responses = self.dispatcher.batch(requests).await?;
            suspension.message_ids = responses.into_iter().map(|r| r.message_id).collect();
            return Ok(suspension);
        }

        let Some(sub) = submissions.pop() else {
            return Err(WorkflowError::malformed("no steps to submit"));
        };
        match (sub.step.step_type, sub.step.is_plan()) {
            (StepType::Wait | StepType::WaitForWebhook, false) => self.submit_wait(&sub).await?,
            (StepType::Invoke, false) => {
                let id = self.submit_invoke(&sub).await?;
                suspension.message_ids.push(id);
            }
            _ => {
                let request = self.continuation_request(&sub)?;
                let response = self.dispatcher.publish(request).await?;
                suspension.message_ids.push(response.message_id);
            }
        }
        Ok(suspension)
    }

    async fn submit_wait(&self, sub: &Submission) -> Result<(), WorkflowError> {
        let step = &sub.step;
        let event_id = step
            .wait_event_id
            .clone()
            .ok_or_else(|| WorkflowError::malformed(format!("wait step '{}' has no event id", step.step_name)))?;
        let built = workflow_headers(&self.header_params(step, &sub.overrides));
        let request = WaitRequest {
            event_id,
            url: self.invocation.url.clone(),
            timeout: Duration::from_secs(step.timeout.unwrap_or_default()),
            timeout_url: self.invocation.url.clone(),
            timeout_headers: built.timeout_headers.unwrap_or_default(),
            headers: built.headers,
            step: step.clone(),
        };
        self.dispatcher.wait(request).await?;
        Ok(())
    }

    /// Start the child run; its final result comes back as this step's result.
    async fn submit_invoke(&self, sub: &Submission) -> Result<String, WorkflowError> {
        let step = &sub.step;
        let url = step
            .invoke_url
            .as_deref()
            .ok_or_else(|| WorkflowError::malformed(format!("invoke step '{}' has no url", step.step_name)))?;
        let child_run_id = child_run_id(&self.invocation.run_id, step.step_id);
        let invoker = Invoker {
            run_id: self.invocation.run_id.clone(),
            url: self.invocation.url.clone(),
            step_id: step.step_id,
            step_name: step.step_name.clone(),
            concurrent: step.concurrent,
        };
        let child_headers: Headers = step
            .invoke_headers
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut params = HeaderParams::new(&child_run_id, url, &child_headers);
        params.init = true;
        params.retries = sub.overrides.retries;
        params.flow_control = sub.overrides.flow_control.as_ref();
        params.invoker = Some(&invoker);
        let headers = workflow_headers(&params).headers;
        let request = PublishRequest::post(url, headers, step.invoke_body.clone().unwrap_or_default());
        let response = self.dispatcher.publish(request).await?;
        Ok(response.message_id)
    }
}

/// Run id of a workflow started by the invoke step at `step_id`.
pub fn child_run_id(parent_run_id: &str, step_id: u64) -> String {
    format!("{parent_run_id}-invoke-{step_id}")
}

fn describe(name: &str, step_type: StepType) -> String {
    format!("'{name}' ({step_type})")
}

fn validate_step(lazy: &LazyStep, recorded: &Step) -> Result<(), WorkflowError> {
    if lazy.step_name() != recorded.step_name || lazy.step_type() != recorded.step_type {
        return Err(WorkflowError::Nondeterminism {
            position: recorded.position(),
            expected: describe(lazy.step_name(), lazy.step_type()),
            found: describe(&recorded.step_name, recorded.step_type),
        });
    }
    Ok(())
}

fn step_in_failure_handler(name: &str) -> WorkflowError {
    WorkflowError::configuration(
        ConfigErrorKind::StepInFailureHandler,
        format!("'{name}' cannot run inside a failure handler"),
    )
}
