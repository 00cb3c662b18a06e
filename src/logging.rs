// Replay-aware logging macros for workflow code. Output is suppressed while
// the context is replaying recorded history, so each statement logs once per
// live execution rather than once per hydration.

#[macro_export]
macro_rules! wf_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(workflow_id = %$ctx.workflow_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! wf_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(workflow_id = %$ctx.workflow_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! wf_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(workflow_id = %$ctx.workflow_id(), $($arg)+);
        }
    }};
}
