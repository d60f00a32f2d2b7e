//! Engine error taxonomy.
//!
//! Denials from [`crate::decision`] are *values*, not errors: a user being
//! refused access is a normal outcome and is carried in the returned
//! `Decision`. The variants here cover rule violations on mutating
//! operations and infrastructure failure. Callers that receive
//! [`EngineError::Storage`] from a read path must treat it as a deny.

use thiserror::Error;

/// Errors produced by the classification and access control engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The change would leave a child record classified below its
    /// parent's effective classification — either by classifying the
    /// child too low, or by raising a parent above an already-classified
    /// descendant. Surfaced verbatim to the caller; never clamped.
    #[error(
        "escalation constraint violated: child classification \"{child_level}\" \
         (rank {child_rank}) would sit below parent classification \
         \"{parent_level}\" (rank {parent_rank}); child records can only \
         escalate to a higher classification, not lower"
    )]
    EscalationViolation {
        /// Name of the child-side classification.
        child_level: String,
        /// Rank of the child-side classification.
        child_rank: i64,
        /// Name of the parent-side classification.
        parent_level: String,
        /// Rank of the parent-side classification.
        parent_rank: i64,
    },

    /// Compartment grant attempted for a user below the compartment's
    /// minimum clearance.
    #[error(
        "insufficient clearance for compartment \"{compartment}\": \
         requires \"{required_level}\" or higher, user holds {held_level}"
    )]
    InsufficientClearance {
        /// Code of the compartment being granted.
        compartment: String,
        /// Name of the compartment's minimum clearance level.
        required_level: String,
        /// Name of the user's current level, or `"no clearance"`.
        held_level: String,
    },

    /// Approve or deny was called on a request that is no longer pending.
    /// Requests are terminal once resolved.
    #[error("access request {request_id} is {status}, not pending; resolved requests are terminal")]
    InvalidTransition {
        /// The request that was targeted.
        request_id: i64,
        /// Its current (terminal) status.
        status: String,
    },

    /// A referenced user, object, classification, or compartment does not
    /// exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity that was looked up.
        entity: &'static str,
        /// The identifier that failed to resolve.
        id: i64,
    },

    /// Underlying persistence failure. Mutations roll back; read paths
    /// fail closed at call sites.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl EngineError {
    /// Returns a stable short code for this error, suitable for audit
    /// context and operator-facing reports.
    #[must_use]
    pub const fn as_code(&self) -> &'static str {
        match self {
            Self::EscalationViolation { .. } => "ESCALATION_VIOLATION",
            Self::InsufficientClearance { .. } => "INSUFFICIENT_CLEARANCE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Storage(_) => "STORAGE_FAILURE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_violation_names_both_levels() {
        let err = EngineError::EscalationViolation {
            child_level: "Public".to_string(),
            child_rank: 0,
            parent_level: "Secret".to_string(),
            parent_rank: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("Public"));
        assert!(msg.contains("Secret"));
        assert!(msg.contains("rank 0"));
        assert!(msg.contains("rank 2"));
    }

    #[test]
    fn invalid_transition_names_status() {
        let err = EngineError::InvalidTransition {
            request_id: 7,
            status: "approved".to_string(),
        };
        assert!(err.to_string().contains("approved"));
        assert_eq!(err.as_code(), "INVALID_TRANSITION");
    }
}
