//! Authorization pre-flight: run the workflow until its first step without
//! side effects.

use tracing::debug;

use super::WorkflowHandler;
use crate::context::WorkflowContext;
use crate::error::{Interrupt, WorkflowError};
use crate::runtime::executor::ExecutionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The workflow reached a step; proceed with the real run.
    StepReached,
    /// The workflow returned before any step; treat as rejected.
    Rejected,
}

/// Run `handler` against a probe copy of `ctx`.
pub async fn try_authentication(
    handler: &dyn WorkflowHandler,
    ctx: &WorkflowContext,
) -> Result<AuthOutcome, WorkflowError> {
    let probe = ctx.with_mode(ExecutionMode::AuthProbe);
    let result = handler.invoke(probe.clone()).await;

    // A probe hit that user code swallowed still counts.
    if matches!(probe.executor().recorded_interrupt(), Some(Interrupt::AuthProbe)) {
        debug!(workflow_run_id = %ctx.run_id(), "auth pre-flight reached a step");
        return Ok(AuthOutcome::StepReached);
    }
    match result {
        Ok(_) => {
            debug!(workflow_run_id = %ctx.run_id(), "auth pre-flight returned before any step");
            Ok(AuthOutcome::Rejected)
        }
        Err(Interrupt::Failed(err)) => Err(err),
        Err(Interrupt::AuthProbe | Interrupt::Suspended(_) | Interrupt::Cancelled) => Ok(AuthOutcome::StepReached),
    }
}
