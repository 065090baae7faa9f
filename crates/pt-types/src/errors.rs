use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the Prompttune system
#[derive(Error, Debug)]
pub enum PtError {
    #[error("Trial infrastructure error: {0}")]
    Infrastructure(#[from] TrialInfrastructureError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Malformed parameter space or optimization settings. Always raised before a
/// session starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("configuration space declares no parameters")]
    EmptySpace,

    #[error("parameter '{name}' has no candidate values")]
    NoCandidates { name: String },

    #[error("parameter '{name}' is declared more than once")]
    DuplicateParameter { name: String },

    #[error("parameter '{name}' lists candidate {value} more than once")]
    DuplicateCandidate { name: String, value: String },

    #[error("parameter '{name}' of kind {kind} cannot hold candidate {value}")]
    KindMismatch {
        name: String,
        kind: String,
        value: String,
    },

    #[error("configuration space has more than {max} points", max = u64::MAX)]
    SpaceTooLarge,

    #[error("max_trials must be a positive integer, got {0}")]
    InvalidMaxTrials(u64),

    #[error("at least one objective is required")]
    NoObjectives,

    #[error("objective '{name}' is declared more than once")]
    DuplicateObjective { name: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure of one dataset example inside a trial. Recorded on the trial
/// record, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TrialExecutionError {
    #[error("callable failed: {0}")]
    Callable(String),

    #[error("callable timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("callable panicked: {0}")]
    Panicked(String),

    #[error("evaluator failed: {0}")]
    Evaluator(String),
}

/// The trial loop itself cannot proceed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialInfrastructureError {
    #[error("dataset contains no examples")]
    EmptyDataset,

    #[error("trial runtime failure: {0}")]
    Runtime(String),
}

/// Misuse of the session state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("session is already terminal")]
    Terminal,

    #[error("session has not been started")]
    NotRunning,

    #[error("trial ordinal {got} is out of order (expected {expected})")]
    OrdinalOutOfOrder { expected: u64, got: u64 },
}

/// Any failure talking to the remote coordination service.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RemoteError {
    #[error("remote endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("remote call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("authentication rejected (status {status})")]
    Authentication { status: u16 },

    #[error("remote server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("unexpected status {status} from remote")]
    UnexpectedStatus { status: u16 },

    #[error("malformed remote response: {0}")]
    MalformedResponse(String),
}

/// Result type alias for Prompttune operations
pub type PtResult<T> = Result<T, PtError>;

/// Macro for creating free-form configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::ConfigurationError::Invalid(format!($($arg)*))
    };
}
