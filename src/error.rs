//! Error types for Prognos.
//!
//! All errors are strongly typed using thiserror. Construction problems,
//! caller mistakes and runtime conditions live in separate enums so callers
//! can pattern match on the category that matters to them.

use thiserror::Error;

use crate::registry::SessionId;

/// Errors raised while building a session component from its name and parameters.
///
/// These are always surfaced at the call that triggered construction and are
/// never deferred into a background job.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Unknown {kind} '{name}'")]
    UnknownComponent {
        kind: &'static str,
        name: String,
    },

    #[error("Invalid configuration for {component}: {reason}")]
    InvalidParameters {
        component: String,
        reason: String,
    },

    #[error("Could not instantiate {component}: {reason}")]
    ConstructionFailed {
        component: String,
        reason: String,
    },
}

impl ConfigurationError {
    /// Shorthand for an unknown component name.
    #[must_use]
    pub fn unknown(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownComponent {
            kind,
            name: name.into(),
        }
    }

    /// Shorthand for malformed parameters.
    #[must_use]
    pub fn invalid(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

/// Validation errors for caller-supplied state and observations.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("State must have every state in the model: had {provided:?}, needed {expected:?}")]
    StateKeyMismatch {
        provided: Vec<String>,
        expected: Vec<String>,
    },

    #[error("Data missing for session {session_id}: expected inputs {inputs:?} and outputs {outputs:?}, missing {missing:?}")]
    MissingData {
        session_id: SessionId,
        inputs: Vec<String>,
        outputs: Vec<String>,
        missing: Vec<String>,
    },

    #[error("Field '{field}' must be finite, got {value}")]
    NonFiniteValue {
        field: String,
        value: f64,
    },

    #[error("Observation at time {time} is older than the current estimate at {current}")]
    OutOfOrderObservation {
        time: f64,
        current: f64,
    },

    #[error("Model could not be initialized from the supplied data: {reason}")]
    InsufficientData {
        reason: String,
    },

    #[error("Invalid distribution: {reason}")]
    InvalidDistribution {
        reason: String,
    },
}

/// Errors that occur while executing session operations.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Session {id} does not exist or has ended")]
    SessionNotFound {
        id: SessionId,
    },

    #[error("Model not initialized")]
    NotInitialized,

    #[error("No completed prediction")]
    NoCompletedPrediction,

    #[error("Prediction job failed: {message}")]
    PredictionJob {
        message: String,
    },

    #[error("Prediction queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Prediction workers disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Numerical failure in {context}: {reason}")]
    Numerical {
        context: String,
        reason: String,
    },
}

/// Top-level error type for Prognos.
#[derive(Debug, Error)]
pub enum ProgError {
    /// Component lookup or construction failed.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Caller-supplied data was rejected.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// An operation could not be carried out in the current session state.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Invariant violation inside the crate (e.g. a poisoned lock).
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable description.
        message: String,
    },
}

impl ProgError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the same request may succeed later without changes.
    ///
    /// A prediction that has not completed yet, a session that is still waiting
    /// for data, and a full prediction queue all resolve on their own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(_) | Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::NoCompletedPrediction
                    | ExecutionError::NotInitialized
                    | ExecutionError::QueueFull { .. }
            ),
        }
    }
}

/// Result type alias for Prognos operations.
pub type ProgResult<T> = Result<T, ProgError>;

pub(crate) fn lock_err(context: &'static str) -> ProgError {
    ProgError::internal(format!("poisoned lock: {context}"))
}
