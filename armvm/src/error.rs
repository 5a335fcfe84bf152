//! Error types for reconciliation passes.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A terminal failure reported by the remote control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status} {code}: {message}")]
pub struct RemoteError {
    /// HTTP status code of the failed call or operation.
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, "NotFound", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, "Conflict", message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// A single constraint violation, addressed by attribute path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{path}`: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Every violation found while validating one configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Violations(Vec<ValidationError>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    pub fn extend(&mut self, other: Violations) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// True if any violation is reported against `path`.
    pub fn mentions(&self, path: &str) -> bool {
        self.0.iter().any(|v| v.path == path)
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> std::result::Result<(), Violations> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl From<ValidationError> for Violations {
    fn from(error: ValidationError) -> Self {
        Self(vec![error])
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

/// Errors that end a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The desired configuration is invalid. Raised before any remote call.
    #[error("invalid configuration: {0}")]
    Validation(Violations),

    /// The resource already exists and has to be imported to be managed.
    #[error("{id} already exists - to be managed it needs to be imported")]
    AlreadyExists { id: String },

    /// The remote control plane rejected an operation on the instance.
    #[error("{operation} {id}: {source}")]
    Remote {
        operation: &'static str,
        id: String,
        #[source]
        source: RemoteError,
    },

    /// The remote control plane rejected an operation on a sub-resource.
    #[error("{operation} sub-resource {id}: {source}")]
    SubResource {
        operation: &'static str,
        id: String,
        #[source]
        source: RemoteError,
    },

    /// The local deadline expired. The remote outcome is unknown and
    /// `elapsed` is the time spent on `operation` alone.
    #[error("timed out after {elapsed:?} waiting to {operation} {id}")]
    Timeout {
        operation: &'static str,
        id: String,
        elapsed: Duration,
    },

    /// The resource disappeared while it was being updated.
    #[error("{id} was not found")]
    NotFound { id: String },

    #[error("invalid resource id {id:?}: {reason}")]
    InvalidIdentity { id: String, reason: String },
}

impl ReconcileError {
    pub fn remote(operation: &'static str, id: impl fmt::Display, source: RemoteError) -> Self {
        Self::Remote {
            operation,
            id: id.to_string(),
            source,
        }
    }

    pub fn sub_resource(
        operation: &'static str,
        id: impl fmt::Display,
        source: RemoteError,
    ) -> Self {
        Self::SubResource {
            operation,
            id: id.to_string(),
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Violations carried by a validation failure.
    pub fn violations(&self) -> Option<&Violations> {
        match self {
            Self::Validation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Violations> for ReconcileError {
    fn from(v: Violations) -> Self {
        Self::Validation(v)
    }
}

/// Result type for reconciliation passes.
pub type Result<T> = std::result::Result<T, ReconcileError>;
