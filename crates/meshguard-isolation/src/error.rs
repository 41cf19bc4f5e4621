use thiserror::Error;

/// Error enum for isolation configuration.
///
/// Runtime containment never fails: releasing a node that is not isolated,
/// or refusing to release a pinned record, is reported as `false`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IsolationError {
    #[error("invalid isolation policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    #[error("invalid circuit breaker config: {0}")]
    InvalidBreakerConfig(String),
}

pub type IsolationResult<T> = Result<T, IsolationError>;
