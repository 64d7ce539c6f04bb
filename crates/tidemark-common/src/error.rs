//! Error types for the tidemark operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the namespace/name/selector context of the object that was
//! being reconciled when the failure happened.
//!
//! Three outcomes matter to callers: success, a [`Error::Requeue`] signal
//! (the pass is waiting on something and must be retried soon), and every
//! other variant, which is a real failure.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for tidemark operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A referenced object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object (e.g. "StorageClass", "Pod")
        kind: String,
        /// Namespaced name of the missing object
        name: String,
    },

    /// Validation error for CRD specs or observed objects
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Namespaced name of the cluster with the invalid input
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.store.storageSize")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Error talking to the cluster's own membership API
    #[error("membership error [{endpoint}]: {message}")]
    Membership {
        /// Endpoint that was queried
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// The pass is waiting on an external condition and must be retried
    #[error("requeue: {message}")]
    Requeue {
        /// Human-readable reason for the wait
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "scaler", "resizer")
        context: String,
    },
}

impl Error {
    /// Create a requeue signal with a human-readable reason
    pub fn requeue(msg: impl Into<String>) -> Self {
        Self::Requeue {
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
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

    /// Create a membership API error
    pub fn membership(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Membership {
            endpoint: endpoint.into(),
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

    /// Whether this is a requeue signal rather than a failure
    pub fn is_requeue(&self) -> bool {
        matches!(self, Error::Requeue { .. })
    }

    /// Whether this error came back from the API server as HTTP 404
    pub fn is_kube_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require config fix).
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::NotFound { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Membership { .. } => true,
            Error::Requeue { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
