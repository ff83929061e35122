// Replay-aware logging macros for workflow code.
//
// They expand to `tracing` events tagged with the run id and stay silent while
// the authorization pre-flight re-executes user code.

#[macro_export]
macro_rules! workflow_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(workflow_run_id = %$ctx.run_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! workflow_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(workflow_run_id = %$ctx.run_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! workflow_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(workflow_run_id = %$ctx.run_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! workflow_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::debug!(workflow_run_id = %$ctx.run_id(), $($arg)+);
        }
    }};
}
