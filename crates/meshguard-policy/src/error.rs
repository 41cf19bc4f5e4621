use thiserror::Error;

/// Error enum for policy engine operations.
///
/// Evaluation never fails: a request that matches nothing resolves to an
/// implicit DENY decision, and a missing attribute makes a condition false.
/// Errors are reserved for malformed input rejected at the boundary and for
/// the enforcement middleware refusing a denied request.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("access denied: {reason} (policy: {policy_id}, rule: {rule_id})")]
    PermissionDenied {
        policy_id: String,
        rule_id: String,
        reason: String,
    },
}

pub type PolicyResult<T> = Result<T, PolicyError>;
