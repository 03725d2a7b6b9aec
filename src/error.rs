//! Error types for the agent runtime.
//!
//! One enum per boundary. Path and codec errors are programmer errors and are
//! returned straight to the caller; task errors travel through the scheduler
//! as the failure value of a [`Synapse`](crate::scheduler::Synapse).

use crate::codec::Fault;
use thiserror::Error;

/// Resource path errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Invalid resource path '{0}': {1}")]
    Format(String, &'static str),

    #[error("Resource paths {0} and {1} are incomparable")]
    Incomparable(String, String),
}

/// Codec boundary errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Unknown wire type: {0}")]
    UnknownType(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Correlation token errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token {0} already carries a responder part")]
    AlreadyExtended(String),

    #[error("Malformed token '{0}'")]
    Malformed(String),
}

/// Misuse of a deferred task
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Task '{0}' is already resolved")]
    AlreadyResolved(String),

    #[error("Task '{label}' resolved as {actual}; cannot register a {requested} callback")]
    OutcomeMismatch {
        label: String,
        actual: &'static str,
        requested: &'static str,
    },
}

/// A capability handler failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Capability '{capability}' failed: {message}")]
pub struct DispatchError {
    pub capability: String,
    pub message: String,
    pub detail: Vec<String>,
}

impl DispatchError {
    pub fn new(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            message: message.into(),
            detail: Vec::new(),
        }
    }

    pub fn with_detail(mut self, line: impl Into<String>) -> Self {
        self.detail.push(line.into());
        self
    }
}

/// Transport collaborator errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Transport not usable")]
    NotUsable,

    #[error("Envelope framing failed: {0}")]
    Frame(String),
}

/// Failure value carried by a resolved task
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("Protocol timeout in task '{0}'")]
    ProtocolTimeout(String),

    #[error("Condition failed for task '{0}'")]
    ConditionFailed(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Remote fault: {0}")]
    Remote(Fault),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TaskError {
    /// Wire representation sent to a peer in an error envelope.
    pub fn to_fault(&self) -> Fault {
        match self {
            TaskError::Remote(fault) => fault.clone(),
            TaskError::Dispatch(err) => Fault {
                class: "DispatchError".to_string(),
                message: err.to_string(),
                backtrace: err.detail.clone(),
            },
            other => Fault {
                class: other.class_name().to_string(),
                message: other.to_string(),
                backtrace: Vec::new(),
            },
        }
    }

    fn class_name(&self) -> &'static str {
        match self {
            TaskError::ProtocolTimeout(_) => "ProtocolTimeout",
            TaskError::ConditionFailed(_) => "ConditionFailed",
            TaskError::AuthorizationDenied(_) => "AuthorizationDenied",
            TaskError::Dispatch(_) => "DispatchError",
            TaskError::Remote(_) => "RemoteFault",
            TaskError::Codec(CodecError::Encoding(_)) => "EncodingError",
            TaskError::Codec(CodecError::UnknownType(_)) => "UnknownTypeError",
            TaskError::Codec(_) => "FormatError",
            TaskError::Transport(_) => "TransportError",
        }
    }
}

/// Errors surfaced by the agent's public API
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
