//! Crate-level error taxonomy for the inference control plane.
//!
//! Every component returns typed error kinds rather than stringly-typed
//! failures; the worker translates them into a terminal frame and a
//! requeue-or-fail decision, and the gateway maps them onto HTTP status
//! codes.

use thiserror::Error;

/// Errors produced by the inference control plane.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GantryError {
    /// The admission queue is at capacity; the request was not enqueued.
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The queue has been shut down; no further work is accepted.
    #[error("queue is shut down")]
    QueueShutdown,

    /// The user's weekly token budget does not cover the request.
    #[error("token budget exceeded ({remaining} tokens remaining this week)")]
    BudgetExceeded { remaining: i64 },

    /// The requested model is not in the active profile's catalogue.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Even after eviction the model would not fit under the hard limit.
    #[error("insufficient VRAM: need {needed_gb:.1} GB, {available_gb:.1} GB free")]
    InsufficientVram { needed_gb: f64, available_gb: f64 },

    /// The crash tracker has tripped for this model.
    #[error("circuit open for model {model} ({crash_count} recent crashes)")]
    CircuitOpen { model: String, crash_count: usize },

    /// A model was requested on an engine that is not registered.
    #[error("no engine registered for backend kind {0}")]
    EngineUnavailable(String),

    /// An engine call failed; see [`EngineError`] for the kind.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An in-flight request exceeded its visibility timeout past the retry cap.
    #[error("visibility timeout for request {0}")]
    VisibilityTimeout(String),

    /// The originating client disconnected mid-stream.
    #[error("client connection gone")]
    ClientGone,

    /// A repository write failed. Non-fatal to the request per policy.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Malformed or incomplete request from the ingress.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An internal invariant was violated.
    #[error("{0}")]
    Internal(String),
}

/// Errors surfaced by an engine adapter.
///
/// `Unreachable`, `Timeout` and 5xx `Status` errors are treated as model
/// crashes by the orchestrator; 4xx `Status` errors are final failures.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine endpoint could not be reached at all.
    #[error("engine unreachable: {0}")]
    Unreachable(String),

    /// The engine did not answer within the request deadline.
    #[error("engine timed out after {0} s")]
    Timeout(u64),

    /// The engine answered with a non-success HTTP status.
    #[error("engine returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The engine answered with a body the adapter could not parse.
    #[error("engine protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Whether this error should count as a crash of the serving model.
    pub fn is_crash(&self) -> bool {
        match self {
            EngineError::Unreachable(_) | EngineError::Timeout(_) => true,
            EngineError::Status { status, .. } => *status >= 500,
            EngineError::Protocol(_) => false,
        }
    }

    /// Short machine-readable label used in crash records and logs.
    pub fn reason(&self) -> String {
        match self {
            EngineError::Unreachable(_) => "engine_unreachable".into(),
            EngineError::Timeout(_) => "engine_timeout".into(),
            EngineError::Status { status, .. } => format!("engine_status_{status}"),
            EngineError::Protocol(_) => "protocol_error".into(),
        }
    }
}

impl GantryError {
    /// Whether the worker should requeue the request after this error.
    ///
    /// Crash-kind engine errors are retriable (the model is marked
    /// unloaded and the request goes back to the head of the queue);
    /// everything else is terminal for the request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GantryError::Engine(e) if e.is_crash())
    }
}

/// Result alias used across the workspace.
pub type GantryResult<T> = Result<T, GantryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_classification() {
        assert!(EngineError::Unreachable("refused".into()).is_crash());
        assert!(EngineError::Timeout(300).is_crash());
        assert!(
            EngineError::Status {
                status: 503,
                message: "overloaded".into()
            }
            .is_crash()
        );
        assert!(
            !EngineError::Status {
                status: 400,
                message: "bad prompt".into()
            }
            .is_crash()
        );
        assert!(!EngineError::Protocol("truncated chunk".into()).is_crash());
    }

    #[test]
    fn retriable_follows_crash_kind() {
        let crash = GantryError::Engine(EngineError::Timeout(10));
        assert!(crash.is_retriable());

        let terminal = GantryError::Engine(EngineError::Status {
            status: 422,
            message: "context too long".into(),
        });
        assert!(!terminal.is_retriable());

        assert!(!GantryError::QueueFull { capacity: 50 }.is_retriable());
    }

    #[test]
    fn reason_labels() {
        assert_eq!(
            EngineError::Status {
                status: 502,
                message: String::new()
            }
            .reason(),
            "engine_status_502"
        );
        assert_eq!(EngineError::Timeout(5).reason(), "engine_timeout");
    }
}
