//! Error types for the lifecycle operator
//!
//! Errors carry the object they concern so a failed reconcile pass can be
//! traced back to a specific ClusterServiceVersion or managed resource.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for lifecycle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The ClusterServiceVersion spec cannot be acted on
    #[error("validation error for {csv}: {message}")]
    Validation {
        /// Name of the ClusterServiceVersion with invalid configuration
        csv: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.install.spec.deployments")
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

    /// A write made by the install executor was rejected
    #[error("failed to install {resource}: {message}")]
    Install {
        /// Kind and name of the resource that could not be written
        resource: String,
        /// Cause reported by the store
        message: String,
    },

    /// Create rejected because the object already exists
    #[error("{resource} already exists")]
    AlreadyExists {
        /// Kind and name of the existing object
        resource: String,
    },

    /// Conditional write rejected because the object changed underneath us
    #[error("conflict writing {resource}: {message}")]
    Conflict {
        /// Kind and name of the contended object
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// Object does not exist
    #[error("{resource} not found")]
    NotFound {
        /// Kind and name of the missing object
        resource: String,
    },

    /// Requirements could not be evaluated (the store was unreachable)
    #[error("evaluation error for {csv}: {message}")]
    Evaluation {
        /// Name of the ClusterServiceVersion being evaluated
        csv: String,
        /// Description of what failed
        message: String,
    },

    /// Operation did not finish in time
    #[error("timed out after {seconds}s waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// How long we waited
        seconds: u64,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "controller", "executor", "pki")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            csv: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with CSV context
    pub fn validation_for(csv: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            csv: csv.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with CSV context and field path
    pub fn validation_for_field(
        csv: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            csv: csv.into(),
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

    /// Create an install error for a resource
    pub fn install(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Install {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an already-exists error for a resource
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
        }
    }

    /// Create a conflict error for a resource
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a resource
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create an evaluation error with CSV context
    pub fn evaluation(csv: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Evaluation {
            csv: csv.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
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

    fn api_status(&self) -> Option<(u16, &str)> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some((ae.code, ae.reason.as_str())),
            _ => None,
        }
    }

    /// True when a create failed because the object is already there
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
            || matches!(self.api_status(), Some((409, "AlreadyExists")))
    }

    /// True when a conditional write lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
            || matches!(self.api_status(), Some((409, reason)) if reason != "AlreadyExists")
    }

    /// True when the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. }) || matches!(self.api_status(), Some((404, _)))
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change. Conflicts and
    /// transient API errors clear up on the next pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Install { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => true,
            Error::Evaluation { .. } => true,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the CSV name if this error is associated with a specific ClusterServiceVersion
    pub fn csv(&self) -> Option<&str> {
        match self {
            Error::Validation { csv, .. } => Some(csv),
            Error::Evaluation { csv, .. } => Some(csv),
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
