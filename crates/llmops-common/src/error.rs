//! Error types for the llmops control plane
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context an operator needs to act on it: the
//! endpoint or resource name, namespace, and the underlying cause.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Remediation checklist attached to authentication failures
pub const AUTH_REMEDIATION: &str = "verify the service account token is mounted and not expired, \
     that the ClusterRole grants create/get/patch/delete on deployments, services, \
     horizontalpodautoscalers, ingresses, pods and inferenceservices in the target namespace, \
     and that the RoleBinding targets the service account this process runs as";

/// Main error type for llmops operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Caller supplied invalid input; nothing was sent to the cluster
    #[error("validation error for {endpoint}: {message}")]
    Validation {
        /// Endpoint (or route) the input was for
        endpoint: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "route", "model_id")
        field: Option<String>,
    },

    /// A referenced record does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind (endpoint, model)
        kind: String,
        /// Record identifier
        id: String,
    },

    /// The cluster rejected our credentials even after a token refresh
    #[error("authentication to the kubernetes API failed during {operation}: {message}; {remediation}")]
    AuthenticationFailed {
        /// Operation that was being attempted
        operation: String,
        /// Message returned by the API server
        message: String,
        /// Operator checklist
        remediation: &'static str,
    },

    /// A create call hit an existing resource (HTTP 409)
    #[error("{kind} {namespace}/{name} already exists")]
    ResourceConflict {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Resource namespace
        namespace: String,
    },

    /// A create call conflicted again after the existing resource was removed
    #[error("{kind} {namespace}/{name} still exists after delete and wait; refusing to retry")]
    ResourceStillExists {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Resource namespace
        namespace: String,
    },

    /// A resource did not disappear within the deletion budget
    #[error("timed out after {waited:?} waiting for {kind} {namespace}/{name} to be deleted; manual intervention required")]
    DeletionTimeout {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Resource namespace
        namespace: String,
        /// How long we waited
        waited: Duration,
    },

    /// Creating the primary workload failed
    #[error("deployment of {endpoint} failed: {message}")]
    DeploymentFailed {
        /// Endpoint being deployed
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// Kubernetes resources for an endpoint could not be torn down
    #[error("deletion of {endpoint} failed: {message}")]
    DeletionFailed {
        /// Endpoint being deleted
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// Optimistic-lock failure on a persisted record
    #[error("endpoint {id} was modified concurrently (expected revision {expected}, found {found})")]
    StaleRevision {
        /// Endpoint id
        id: String,
        /// Revision the writer read
        expected: u64,
        /// Revision currently stored
        found: u64,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Configuration could not be loaded or is unusable
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "deployer")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            endpoint: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with endpoint context
    pub fn validation_for(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            endpoint: endpoint.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with endpoint context and field name
    pub fn validation_for_field(
        endpoint: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            endpoint: endpoint.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create an authentication failure with the standard remediation text
    pub fn authentication_failed(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            operation: operation.into(),
            message: msg.into(),
            remediation: AUTH_REMEDIATION,
        }
    }

    /// Create a deployment failure
    pub fn deployment_failed(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DeploymentFailed {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a deletion failure
    pub fn deletion_failed(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DeletionFailed {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
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

    /// HTTP status code returned by the API server, if this is an API error
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            Error::AuthenticationFailed { .. } => Some(401),
            Error::ResourceConflict { .. } => Some(409),
            _ => None,
        }
    }

    /// True for HTTP 404 responses
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// True for HTTP 409 responses
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    /// True for HTTP 401 responses
    pub fn is_unauthorized(&self) -> bool {
        self.status_code() == Some(401)
    }

    /// Check if this error is retryable
    ///
    /// Validation, authentication and lock failures need a human or a fresh
    /// read before retrying. Kubernetes errors are retryable unless they are 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::AuthenticationFailed { .. } => false,
            Error::ResourceConflict { .. } => true,
            Error::ResourceStillExists { .. } => false,
            Error::DeletionTimeout { .. } => false,
            Error::DeploymentFailed { .. } => false,
            Error::DeletionFailed { .. } => true,
            Error::StaleRevision { .. } => true,
            Error::Serialization { .. } => false,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the endpoint this error refers to, when known
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Error::Validation { endpoint, .. } => Some(endpoint),
            Error::DeploymentFailed { endpoint, .. } => Some(endpoint),
            Error::DeletionFailed { endpoint, .. } => Some(endpoint),
            Error::StaleRevision { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Build a `kube::Error::Api` with the given status code.
///
/// Used by tests and fakes to simulate API server responses.
pub fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Endpoint Operations
    // ==========================================================================

    /// Story: bad input is rejected before the cluster is touched
    #[test]
    fn story_validation_errors_carry_endpoint_and_field() {
        let err = Error::validation_for_field("dev:/serve/m1", "route", "route already in use");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("dev:/serve/m1"));
        assert_eq!(err.endpoint(), Some("dev:/serve/m1"));
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("route")),
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    /// Story: a 401 from the cluster surfaces with operator guidance
    #[test]
    fn story_authentication_failure_includes_remediation() {
        let err = Error::authentication_failed("check existing deployment", "Unauthorized");
        let text = err.to_string();
        assert!(text.contains("check existing deployment"));
        assert!(text.contains("service account token"));
        assert!(err.is_unauthorized());
        assert!(!err.is_retryable());
    }

    #[test]
    fn story_deletion_timeout_names_stuck_resource() {
        let err = Error::DeletionTimeout {
            kind: "Deployment".to_string(),
            name: "ep-0123456789ab".to_string(),
            namespace: "llmops-dev".to_string(),
            waited: Duration::from_secs(120),
        };
        let text = err.to_string();
        assert!(text.contains("llmops-dev/ep-0123456789ab"));
        assert!(text.contains("Deployment"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_status_code_classification() {
        let conflict = Error::from(api_error(409, "AlreadyExists", "exists"));
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());

        let missing = Error::from(api_error(404, "NotFound", "gone"));
        assert!(missing.is_not_found());
        assert!(!missing.is_retryable());

        let unauthorized = Error::from(api_error(401, "Unauthorized", "token expired"));
        assert!(unauthorized.is_unauthorized());

        let server = Error::from(api_error(503, "ServiceUnavailable", "etcd down"));
        assert!(server.is_retryable());
        assert_eq!(server.status_code(), Some(503));

        assert_eq!(Error::internal("boom").status_code(), None);
    }

    #[test]
    fn test_resource_still_exists_is_fatal() {
        let err = Error::ResourceStillExists {
            kind: "Deployment".to_string(),
            name: "ep-abc".to_string(),
            namespace: "llmops-prod".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("refusing to retry"));
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        let err = Error::internal_with_context("reconciler", "unexpected state");
        assert!(err.to_string().contains("[reconciler]"));
    }

    #[test]
    fn test_serde_json_errors_convert() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
