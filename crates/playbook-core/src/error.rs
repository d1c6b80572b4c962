// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for playbook-core.
//!
//! Provides a unified error type that maps to stable machine-readable codes
//! for the control surface.

use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors that can occur during request processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// No resolved security context was supplied.
    Unauthorized {
        /// Why the context could not be established.
        reason: String,
    },

    /// Caller is authenticated but lacks a required permission.
    Forbidden {
        /// The permission that was missing.
        permission: String,
    },

    /// A uniqueness or concurrency contract was violated.
    Conflict {
        /// The resource the conflict occurred on.
        resource: String,
        /// Conflict details.
        details: String,
    },

    /// An illegal state transition was requested for a run.
    InvalidStatus {
        /// The run ID.
        run_id: String,
        /// The requested transition or action.
        requested: String,
        /// The run's current status.
        current: String,
    },

    /// A cancel was requested for a run that is already cancelled.
    AlreadyCancelled {
        /// The run ID.
        run_id: String,
    },

    /// An unknown control action was requested.
    InvalidAction {
        /// The action string that was not recognized.
        action: String,
    },

    /// A step precondition failed; the step and instance fail closed.
    GuardrailViolation {
        /// The step whose guardrail failed.
        step_id: String,
        /// The guardrail kind.
        guardrail: String,
        /// Human-readable description of the failure.
        message: String,
    },

    /// A run, definition, or entity was not found.
    NotFound {
        /// The kind of object (run, definition, entity, status).
        kind: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// A store call failed while executing a step's actions.
    ActionFailed {
        /// The step the action belongs to.
        step_id: String,
        /// The action tag.
        action: String,
        /// Failure details.
        details: String,
    },

    /// The underlying cancel primitive reported failure.
    CancellationFailed {
        /// The run ID.
        run_id: String,
        /// Failure details.
        details: String,
    },

    /// Input validation failed.
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Store operation failed.
    Store {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the stable error code string for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Conflict { .. } => "CONFLICT",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::AlreadyCancelled { .. } => "ALREADY_CANCELLED",
            Self::InvalidAction { .. } => "INVALID_ACTION",
            Self::GuardrailViolation { .. } => "GUARDRAIL_VIOLATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ActionFailed { .. } => "ACTION_FAILED",
            Self::CancellationFailed { .. } => "CANCELLATION_FAILED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Store { .. } => "STORE_ERROR",
        }
    }

    /// Whether the error message may contain store-adapter internals.
    ///
    /// Callers without elevated read permission receive a generic message
    /// for sensitive errors instead of the full details.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized { reason } => {
                write!(f, "Unauthorized: {}", reason)
            }
            Self::Forbidden { permission } => {
                write!(f, "Missing required permission '{}'", permission)
            }
            Self::Conflict { resource, details } => {
                write!(f, "Conflict on {}: {}", resource, details)
            }
            Self::InvalidStatus {
                run_id,
                requested,
                current,
            } => {
                write!(
                    f,
                    "Cannot {} run '{}' in status '{}'",
                    requested, run_id, current
                )
            }
            Self::AlreadyCancelled { run_id } => {
                write!(f, "Run '{}' is already cancelled", run_id)
            }
            Self::InvalidAction { action } => {
                write!(f, "Unknown run action '{}'", action)
            }
            Self::GuardrailViolation {
                step_id,
                guardrail,
                message,
            } => {
                write!(
                    f,
                    "Guardrail '{}' failed for step '{}': {}",
                    guardrail, step_id, message
                )
            }
            Self::NotFound { kind, id } => {
                write!(f, "{} '{}' not found", kind, id)
            }
            Self::ActionFailed {
                step_id,
                action,
                details,
            } => {
                write!(
                    f,
                    "Action '{}' failed in step '{}': {}",
                    action, step_id, details
                )
            }
            Self::CancellationFailed { run_id, details } => {
                write!(f, "Failed to cancel run '{}': {}", run_id, details)
            }
            Self::Validation { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Store { operation, details } => {
                write!(f, "Store error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Store {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Store {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                EngineError::Unauthorized {
                    reason: "missing header".to_string(),
                },
                "UNAUTHORIZED",
            ),
            (
                EngineError::Forbidden {
                    permission: "playbook_run:cancel".to_string(),
                },
                "FORBIDDEN",
            ),
            (
                EngineError::Conflict {
                    resource: "idempotency_record".to_string(),
                    details: "key reused".to_string(),
                },
                "CONFLICT",
            ),
            (
                EngineError::InvalidStatus {
                    run_id: "run-1".to_string(),
                    requested: "resume".to_string(),
                    current: "running".to_string(),
                },
                "INVALID_STATUS",
            ),
            (
                EngineError::AlreadyCancelled {
                    run_id: "run-1".to_string(),
                },
                "ALREADY_CANCELLED",
            ),
            (
                EngineError::InvalidAction {
                    action: "explode".to_string(),
                },
                "INVALID_ACTION",
            ),
            (
                EngineError::GuardrailViolation {
                    step_id: "approve".to_string(),
                    guardrail: "payment_required".to_string(),
                    message: "no settled payment".to_string(),
                },
                "GUARDRAIL_VIOLATION",
            ),
            (
                EngineError::NotFound {
                    kind: "run",
                    id: "run-404".to_string(),
                },
                "NOT_FOUND",
            ),
            (
                EngineError::ActionFailed {
                    step_id: "create".to_string(),
                    action: "create_entity".to_string(),
                    details: "boom".to_string(),
                },
                "ACTION_FAILED",
            ),
            (
                EngineError::CancellationFailed {
                    run_id: "run-1".to_string(),
                    details: "store unavailable".to_string(),
                },
                "CANCELLATION_FAILED",
            ),
            (
                EngineError::Validation {
                    field: "definition_id".to_string(),
                    message: "must be a UUID".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                EngineError::Store {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "STORE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::Forbidden {
            permission: "playbook_run:cancel".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Missing required permission 'playbook_run:cancel'"
        );

        let err = EngineError::InvalidStatus {
            run_id: "abc-123".to_string(),
            requested: "resume".to_string(),
            current: "running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot resume run 'abc-123' in status 'running'"
        );

        let err = EngineError::AlreadyCancelled {
            run_id: "abc-123".to_string(),
        };
        assert_eq!(err.to_string(), "Run 'abc-123' is already cancelled");

        let err = EngineError::NotFound {
            kind: "definition",
            id: "def-404".to_string(),
        };
        assert_eq!(err.to_string(), "definition 'def-404' not found");

        let err = EngineError::GuardrailViolation {
            step_id: "ship".to_string(),
            guardrail: "payment_required".to_string(),
            message: "Payment required before shipping".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Guardrail 'payment_required' failed for step 'ship': Payment required before shipping"
        );
    }

    #[test]
    fn test_sensitivity() {
        assert!(
            EngineError::Store {
                operation: "query".to_string(),
                details: "relation does not exist".to_string(),
            }
            .is_sensitive()
        );
        assert!(
            !EngineError::Forbidden {
                permission: "x".to_string(),
            }
            .is_sensitive()
        );
        assert!(
            !EngineError::NotFound {
                kind: "run",
                id: "x".to_string(),
            }
            .is_sensitive()
        );
    }
}
