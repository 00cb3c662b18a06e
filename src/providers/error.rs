/// Provider error with retry classification.
///
/// Providers report failures with a flag saying whether the caller may
/// retry the operation. The runtime retries retryable failures with
/// backoff and abandons the work item once attempts are exhausted;
/// permanent failures are surfaced immediately.
///
/// Retryable: lock contention, timeouts, partially written files, any
/// transient resource failure. Permanent: corrupt data, unknown
/// workflow ids, invalid lock tokens, malformed items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed, e.g. "ack_workflow_item".
    pub operation: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the caller may retry.
    pub retryable: bool,
}

impl ProviderError {
    /// A transient failure that may succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; retrying cannot help.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Classify an I/O failure. Interrupted and timeout-like conditions
    /// are retryable; everything else is treated as permanent.
    pub fn from_io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let retryable = matches!(
            err.kind(),
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::UnexpectedEof
        );
        Self {
            operation: operation.into(),
            message: err.to_string(),
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
