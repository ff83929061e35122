use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::DispatcherError;

/// What kind of misconfiguration was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// A step was declared while another step was still executing.
    NestedStep,
    /// A step was declared with an empty name.
    EmptyStepName,
    /// The inbound protocol-version header does not match ours.
    ProtocolVersionMismatch,
    /// History entries could not be decoded.
    MalformedHistory,
    /// A continuation request arrived without a run id.
    MissingRunId,
    /// A failure callback arrived but no failure handler is registered.
    MissingFailureHandler,
    /// Steps were declared from inside a failure handler.
    StepInFailureHandler,
    /// Dispatcher credentials are missing from the environment.
    MissingCredentials,
    /// A configured or inbound URL could not be parsed.
    InvalidUrl,
}

impl ConfigErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigErrorKind::NestedStep => "nested_step",
            ConfigErrorKind::EmptyStepName => "empty_step_name",
            ConfigErrorKind::ProtocolVersionMismatch => "protocol_version_mismatch",
            ConfigErrorKind::MalformedHistory => "malformed_history",
            ConfigErrorKind::MissingRunId => "missing_run_id",
            ConfigErrorKind::MissingFailureHandler => "missing_failure_handler",
            ConfigErrorKind::StepInFailureHandler => "step_in_failure_handler",
            ConfigErrorKind::MissingCredentials => "missing_credentials",
            ConfigErrorKind::InvalidUrl => "invalid_url",
        }
    }
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the engine and by user workflow code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    /// Fatal misuse or malformed input. Retrying does not help.
    #[error("configuration error ({kind}): {message}")]
    Configuration { kind: ConfigErrorKind, message: String },

    /// A replayed step disagrees with what the workflow declared at the same position.
    #[error("non-deterministic workflow at step {position}: expected {expected}, got {found} from the request")]
    Nondeterminism {
        position: u64,
        expected: String,
        found: String,
    },

    /// User-classified failure that must not be retried by the dispatcher.
    #[error("{message}")]
    NonRetryable { message: String },

    /// User-classified failure asking the dispatcher to back off.
    #[error("{message} (retry after {}s)", delay.as_secs())]
    RetryAfter { delay: Duration, message: String },

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    /// Unclassified failure from user code.
    #[error("step '{name}' failed: {message}")]
    Step { name: String, message: String },
}

impl WorkflowError {
    pub fn configuration(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        WorkflowError::Configuration {
            kind,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        WorkflowError::NonRetryable {
            message: message.into(),
        }
    }

    pub fn retry_after(delay: Duration, message: impl Into<String>) -> Self {
        WorkflowError::RetryAfter {
            delay,
            message: message.into(),
        }
    }

    pub fn step(name: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Step {
            name: name.into(),
            message: message.into(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::configuration(ConfigErrorKind::MalformedHistory, message)
    }

    /// Short name reported in the `error` field of failure responses.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowError::Configuration { .. } => "WorkflowError",
            WorkflowError::Nondeterminism { .. } => "WorkflowNondeterminismError",
            WorkflowError::NonRetryable { .. } => "WorkflowNonRetryableError",
            WorkflowError::RetryAfter { .. } => "WorkflowRetryAfterError",
            WorkflowError::Dispatcher(_) => "DispatcherError",
            WorkflowError::Step { .. } => "Error",
        }
    }

    pub fn config_kind(&self) -> Option<ConfigErrorKind> {
        match self {
            WorkflowError::Configuration { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Why an invocation stopped after handing work to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// A single result step was submitted.
    StepSubmitted,
    /// Plan steps for a parallel group were submitted.
    PlanSubmitted,
    /// A parallel branch was already handled by a sibling delivery.
    BranchDiscarded,
}

/// Payload of the control-transfer signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspension {
    pub step_name: String,
    pub position: u64,
    pub reason: SuspendReason,
    pub message_ids: Vec<String>,
}

/// Non-local exit from workflow code.
///
/// Every step operation returns `Result<T, Interrupt>`; user code propagates
/// it with `?` so the boundary can tell a suspension from a real failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// Work was handed to the dispatcher; this invocation is done.
    Suspended(Suspension),
    /// The workflow asked for its own cancellation.
    Cancelled,
    /// The authorization pre-flight reached a step.
    AuthProbe,
    Failed(WorkflowError),
}

impl From<WorkflowError> for Interrupt {
    fn from(err: WorkflowError) -> Self {
        Interrupt::Failed(err)
    }
}

impl From<DispatcherError> for Interrupt {
    fn from(err: DispatcherError) -> Self {
        Interrupt::Failed(err.into())
    }
}

pub type StepResult<T> = Result<T, Interrupt>;
