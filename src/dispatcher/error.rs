/// Failure classification for dispatcher calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherErrorKind {
    /// Network failure, timeout, 5xx. Worth retrying.
    Transport,
    /// The run or resource does not exist (anymore).
    NotFound,
    /// The run was already cancelled or completed.
    RunEnded,
    /// The dispatcher rejected the request (4xx other than not-found).
    Rejected,
}

/// Dispatcher error with retry classification
///
/// Dispatcher implementations return this so the engine can tell benign
/// "run already ended" answers apart from real failures.
///
/// # Example Usage
///
/// ```rust,no_run
/// use stepwire::dispatcher::DispatcherError;
///
/// # fn example() -> Result<(), DispatcherError> {
/// return Err(DispatcherError::transport("publish", "connection reset"));
/// # }
///
/// # fn example2() -> Result<(), DispatcherError> {
/// return Err(DispatcherError::run_ended("cancel", "workflowRun already cancelled"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherError {
    /// Operation that failed (e.g., "publish", "cancel")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    pub kind: DispatcherErrorKind,
}

impl DispatcherError {
    pub fn new(kind: DispatcherErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DispatcherErrorKind::Transport, operation, message)
    }

    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DispatcherErrorKind::NotFound, operation, message)
    }

    pub fn run_ended(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DispatcherErrorKind::RunEnded, operation, message)
    }

    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DispatcherErrorKind::Rejected, operation, message)
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind == DispatcherErrorKind::Transport
    }

    /// True when the run was already finished or cancelled on the dispatcher side.
    pub fn is_run_ended(&self) -> bool {
        matches!(self.kind, DispatcherErrorKind::RunEnded | DispatcherErrorKind::NotFound)
    }

    /// Map an HTTP status and response text onto a classified error.
    pub fn from_status(operation: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let lowered = body.to_ascii_lowercase();
        let kind = if status == 404 || lowered.contains("not found") {
            DispatcherErrorKind::NotFound
        } else if lowered.contains("already cancelled")
            || lowered.contains("already canceled")
            || lowered.contains("already completed")
            || lowered.contains("run ended")
        {
            DispatcherErrorKind::RunEnded
        } else if (400..500).contains(&status) {
            DispatcherErrorKind::Rejected
        } else {
            DispatcherErrorKind::Transport
        };
        Self::new(kind, operation, format!("status {status}: {body}"))
    }
}

impl std::fmt::Display for DispatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for DispatcherError {}
