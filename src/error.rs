//! Error taxonomy shared by workflow code, activities, and recorded history.
//!
//! `WorkflowError` is what workflow code observes when awaiting durable work
//! and what terminal failure events carry. `AppError` is the application-level
//! failure raised by activity and handler code, with a retry classification
//! the invoker honors.

use serde::{Deserialize, Serialize};

/// Application-level failure raised by an activity or handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine-readable failure kind, matched against retry policy
    /// non-retryable lists (e.g. "validation", "insufficient_funds").
    pub kind: String,
    pub message: String,
    /// Whether the invoker may retry this failure at all.
    pub retryable: bool,
}

impl AppError {
    /// A retryable application failure.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that must never be retried regardless of policy.
    pub fn non_retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AppError {}

/// Failure observed by workflow code, and the payload of failure events.
///
/// Nondeterminism and storage unavailability are deliberately absent: the
/// former suspends the execution for operator intervention, the latter is
/// retried by the hosting process. Neither ever becomes a workflow result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkflowError {
    /// Application failure propagated from an activity or handler.
    Application(AppError),
    /// A deadline elapsed: an activity attempt, a condition wait, or the
    /// whole run.
    Timeout { what: String, after_ms: u64 },
    /// Cooperative cancellation reached this wait.
    Cancelled { reason: String },
    /// Deployment problem: unregistered workflow or activity name, bad
    /// version. Never retryable.
    Configuration { message: String },
}

impl WorkflowError {
    pub fn app(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application(AppError::new(kind, message))
    }

    pub fn non_retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application(AppError::non_retryable(kind, message))
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Failure kind used for non-retryable matching in retry policies.
    pub fn kind(&self) -> &str {
        match self {
            Self::Application(e) => &e.kind,
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Configuration { .. } => "configuration",
        }
    }

    /// Whether this failure is retryable in principle. Retry policies apply
    /// their own attempt and kind limits on top.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Application(e) => e.retryable,
            Self::Timeout { .. } => true,
            Self::Cancelled { .. } => false,
            Self::Configuration { .. } => false,
        }
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Application(e) => write!(f, "application error: {e}"),
            Self::Timeout { what, after_ms } => {
                write!(f, "{what} timed out after {after_ms}ms")
            }
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
            Self::Configuration { message } => write!(f, "configuration error: {message}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<AppError> for WorkflowError {
    fn from(e: AppError) -> Self {
        Self::Application(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(WorkflowError::app("io", "connection reset").retryable());
        assert!(!WorkflowError::non_retryable("validation", "bad input").retryable());
        assert!(WorkflowError::Timeout {
            what: "activity Charge attempt 1".into(),
            after_ms: 500,
        }
        .retryable());
        assert!(!WorkflowError::Cancelled {
            reason: "user request".into()
        }
        .retryable());
        assert!(!WorkflowError::configuration("unregistered: Charge").retryable());
    }

    #[test]
    fn kind_mapping() {
        assert_eq!(WorkflowError::app("io", "x").kind(), "io");
        assert_eq!(
            WorkflowError::Timeout {
                what: "t".into(),
                after_ms: 1
            }
            .kind(),
            "timeout"
        );
        assert_eq!(
            WorkflowError::Cancelled { reason: "r".into() }.kind(),
            "cancelled"
        );
    }

    #[test]
    fn round_trips_through_json() {
        let err = WorkflowError::non_retryable("insufficient_funds", "balance too low");
        let json = serde_json::to_string(&err).unwrap();
        let back: WorkflowError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
