//! Error types for the job manager domain.
//!
//! The variants map one-to-one onto the error kinds callers are expected to
//! branch on: CAS conflicts are retried (bounded) at the call site that
//! issued them, everything else is surfaced.

use echelon_core::JobId;

/// The result type used throughout echelon-jobmgr.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in job manager operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A job, task, cache entry, watch id, or pod event was not found.
    #[error("not found: {resource} {id}")]
    NotFound {
        /// The kind of resource that was looked up.
        resource: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The request was malformed or not permitted for the entity's state.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what made the request invalid.
        message: String,
    },

    /// A write operation was attempted while this instance is not leader.
    #[error("unavailable: {message}")]
    Unavailable {
        /// Description of why the operation is unavailable.
        message: String,
    },

    /// A hard resource cap was reached (e.g. the watch client limit).
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// Description of the exhausted resource.
        message: String,
    },

    /// A compare-and-set write lost the race against a concurrent writer.
    #[error("unexpected version: expected {expected}, found {actual}")]
    UnexpectedVersion {
        /// The revision the caller expected to replace.
        expected: u64,
        /// The revision actually present in the store.
        actual: u64,
    },

    /// The call context's deadline expired before the operation finished.
    #[error("deadline exceeded: {message}")]
    DeadlineExceeded {
        /// Description of the operation that timed out.
        message: String,
    },

    /// A store or downstream failure that is not the caller's fault.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a not-found error for a job.
    #[must_use]
    pub fn job_not_found(job_id: &JobId) -> Self {
        Self::NotFound {
            resource: "job",
            id: job_id.to_string(),
        }
    }

    /// Creates a not-found error for a task.
    #[must_use]
    pub fn task_not_found(job_id: &JobId, instance_id: u32) -> Self {
        Self::NotFound {
            resource: "task",
            id: job_id.instance_name(instance_id),
        }
    }

    /// Creates a not-found error for an arbitrary resource kind.
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a resource-exhausted error.
    #[must_use]
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Creates a deadline-exceeded error.
    #[must_use]
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new internal error with a source cause.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true for CAS conflicts, the one kind callers may retry.
    #[must_use]
    pub const fn is_unexpected_version(&self) -> bool {
        matches!(self, Self::UnexpectedVersion { .. })
    }

    /// Returns true when the error is a not-found kind.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::job_not_found(&JobId::new("j1"));
        assert_eq!(err.to_string(), "not found: job j1");
    }

    #[test]
    fn unexpected_version_is_retriable_kind() {
        let err = Error::UnexpectedVersion {
            expected: 3,
            actual: 4,
        };
        assert!(err.is_unexpected_version());
        assert!(!Error::internal("boom").is_unexpected_version());
    }

    #[test]
    fn internal_error_carries_source() {
        use std::error::Error as StdError;
        let source = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = Error::internal_with_source("store write failed", source);
        assert!(StdError::source(&err).is_some());
    }
}
