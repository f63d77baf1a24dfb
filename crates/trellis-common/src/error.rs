//! Error types for the Trellis eventing controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the resource it concerns and a classification
//! that the controllers' error policies use to pick a requeue strategy.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a resource spec (requires a spec edit to fix)
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.channelTemplate")
        field: Option<String>,
    },

    /// A child object exists under the expected name but is controlled by someone else
    #[error("{owner_kind} \"{owner}\" does not own {kind} \"{name}\"")]
    Ownership {
        /// Lowercase kind of the presumptive owner (e.g., "trigger")
        owner_kind: String,
        /// Name of the presumptive owner
        owner: String,
        /// Lowercase kind of the conflicting child (e.g., "subscription")
        kind: String,
        /// Name of the conflicting child
        name: String,
    },

    /// Optimistic concurrency failure on a write (resourceVersion mismatch)
    #[error("conflict writing {resource}: {message}")]
    Conflict {
        /// Resource whose write was rejected
        resource: String,
        /// Message returned by the API server
        message: String,
    },

    /// A referenced object could not be resolved or is not usable yet
    #[error("{message}")]
    Reference {
        /// Machine-readable reason (mirrors the condition reason)
        reason: String,
        /// Human-readable message
        message: String,
    },

    /// The reconciliation pass was cancelled or ran past its deadline
    #[error("reconciliation cancelled before {operation}")]
    Cancelled {
        /// The store operation that was about to run
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "broker", "trigger", "resolver")
        context: String,
    },
}

impl Error {
    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an ownership conflict between an owner and a child object
    pub fn ownership(
        owner_kind: impl Into<String>,
        owner: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::Ownership {
            owner_kind: owner_kind.into(),
            owner: owner.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a reference resolution error
    pub fn reference(reason: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Reference {
            reason: reason.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error for the operation that was about to run
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a failed write against the API server.
    ///
    /// HTTP 409 means another writer got there first; the whole pass is
    /// re-run against fresh state instead of blindly retrying the write.
    pub fn from_write(resource: impl Into<String>, source: kube::Error) -> Self {
        match source {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                resource: resource.into(),
                message: ae.message,
            },
            other => Self::Kube { source: other },
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and ownership errors are not retryable
    /// (they need a human to fix the objects involved). Kubernetes errors
    /// depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout, throttling)
                // Don't retry on other 4xx errors (validation, forbidden, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae)
                        if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
                )
            }
            Error::Validation { .. } => false,
            Error::Ownership { .. } => false,
            Error::Conflict { .. } => true,
            Error::Reference { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error is an ownership conflict on a child object
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(self, Error::Ownership { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Error Classification in Reconciliation
    // ==========================================================================

    /// Story: a broker without a channel template is a spec problem
    ///
    /// Nothing transient will fix it, so the controller waits for an edit.
    #[test]
    fn story_validation_errors_wait_for_spec_change() {
        let err = Error::validation_for_field(
            "default/my-broker",
            "spec.channelTemplate",
            "Broker.Spec.ChannelTemplate is nil",
        );
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("default/my-broker"));
        assert!(!err.is_retryable());

        match &err {
            Error::Validation {
                resource, field, ..
            } => {
                assert_eq!(resource, "default/my-broker");
                assert_eq!(field.as_deref(), Some("spec.channelTemplate"));
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: a subscription squatting on the trigger's name is reported verbatim
    #[test]
    fn story_ownership_conflict_names_both_objects() {
        let err = Error::ownership(
            "trigger",
            "test-trigger",
            "subscription",
            "test-broker-test-trigger-test-trigger-uid",
        );
        assert_eq!(
            err.to_string(),
            "trigger \"test-trigger\" does not own subscription \"test-broker-test-trigger-test-trigger-uid\""
        );
        assert!(err.is_ownership_conflict());
        assert!(!err.is_retryable());
    }

    /// Story: status writes racing with another writer re-run the pass
    #[test]
    fn story_write_conflicts_are_retryable() {
        let err = Error::from_write("default/my-trigger", api_error(409));
        assert!(matches!(err, Error::Conflict { ref resource, .. } if resource == "default/my-trigger"));
        assert!(err.is_retryable());

        let err = Error::from_write("default/my-trigger", api_error(500));
        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn kube_client_errors_are_not_retryable() {
        let err: Error = api_error(403).into();
        assert!(!err.is_retryable());

        let err: Error = api_error(429).into();
        assert!(err.is_retryable());

        let err: Error = api_error(503).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn reference_errors_display_only_the_message() {
        let err = Error::reference("DependencyDoesNotExist", "Dependency does not exist: gone");
        assert_eq!(err.to_string(), "Dependency does not exist: gone");
        assert!(err.is_retryable());
    }

    #[test]
    fn cancellation_names_the_pending_operation() {
        let err = Error::cancelled("create subscription");
        assert!(err.to_string().contains("create subscription"));
        assert!(err.is_retryable());
    }

    #[test]
    fn internal_error_context() {
        let err = Error::internal_with_context("broker", "unexpected state");
        assert!(err.to_string().contains("[broker]"));

        let err = Error::internal("unexpected state");
        assert!(matches!(err, Error::Internal { ref context, .. } if context == UNKNOWN_CONTEXT));
        assert!(err.is_retryable());
    }
}
