//! Errors raised by adaptors.

use thiserror::Error;

/// Result type used throughout the adaptor interface.
pub type AdaptorResult<T> = Result<T, AdaptorError>;

/// Every failure an adaptor can raise.
///
/// The set is closed on purpose so that callers can classify failures with
/// an exhaustive `match` instead of probing error types at runtime.
#[derive(Debug, Error)]
pub enum AdaptorError {
    /// Path does not exist
    #[error("no such path: {0}")]
    NoSuchPath(String),
    /// Path exists but the operation requires that it does not
    #[error("path already exists: {0}")]
    PathAlreadyExists(String),
    /// Directory still has entries and recursive deletion was not requested
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    /// Path could not be parsed or escapes the file system root
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// No adaptor is registered under this name
    #[error("unknown adaptor: {0}")]
    UnknownAdaptor(String),
    /// Property is not supported by the adaptor
    #[error("unknown property: {0}")]
    UnknownProperty(String),
    /// Property is supported but its value is malformed
    #[error("invalid property {name}: {reason}")]
    InvalidProperty {
        /// Property name
        name: String,
        /// Why the value was rejected
        reason: String,
    },
    /// Location is not accepted by the adaptor
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    /// Credential type is not accepted by the adaptor
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    /// Queue does not exist
    #[error("no such queue: {0}")]
    NoSuchQueue(String),
    /// Job is not (or no longer) known to the scheduler
    #[error("no such job: {0}")]
    NoSuchJob(String),
    /// Copy operation is not (or no longer) known to the file system
    #[error("no such copy: {0}")]
    NoSuchCopy(String),
    /// Job description is missing a required field
    #[error("incomplete job description: {0}")]
    IncompleteJobDescription(String),
    /// Job description holds a value the scheduler rejects
    #[error("invalid job description: {0}")]
    InvalidJobDescription(String),
    /// Job description uses a feature the scheduler does not support
    #[error("unsupported job description: {0}")]
    UnsupportedJobDescription(String),
    /// Argument is malformed or contradicts another argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Back end is reachable but the session is closed
    #[error("not connected: {0}")]
    NotConnected(String),
    /// Operation is not supported by this adaptor
    #[error("{adaptor} adaptor does not support {operation}")]
    UnsupportedOperation {
        /// Adaptor name
        adaptor: String,
        /// Name of the rejected operation
        operation: String,
    },
    /// Job was cancelled before it finished
    #[error("job cancelled: {0}")]
    JobCancelled(String),
    /// Copy was cancelled before it finished
    #[error("copy cancelled: {0}")]
    CopyCancelled(String),
    /// Back-end specific failure with no finer classification
    #[error("{adaptor} adaptor failure: {message}")]
    Backend {
        /// Adaptor name
        adaptor: String,
        /// Failure reported by the back end
        message: String,
    },
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdaptorError {
    /// Shorthand for [`AdaptorError::UnsupportedOperation`].
    pub fn unsupported(adaptor: &str, operation: &str) -> Self {
        Self::UnsupportedOperation {
            adaptor: adaptor.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Shorthand for [`AdaptorError::Backend`].
    pub fn backend(adaptor: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            adaptor: adaptor.to_string(),
            message: message.into(),
        }
    }

    /// Map an IO error raised while touching `path` to the most specific variant.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Self::NoSuchPath(path.to_string()),
            ErrorKind::AlreadyExists => Self::PathAlreadyExists(path.to_string()),
            ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty(path.to_string()),
            ErrorKind::InvalidInput | ErrorKind::InvalidFilename => {
                Self::InvalidPath(path.to_string())
            }
            _ => Self::Io(err),
        }
    }
}

/// Error kind embedded in job and copy statuses.
///
/// Statuses report failures that belong to the operation rather than to the
/// call that fetched the status, so they carry a reduced classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusErrorType {
    /// Operation is unknown
    NotFound,
    /// Operation was cancelled
    Cancelled,
    /// Target already existed
    AlreadyExists,
    /// Session is closed
    NotConnected,
    /// Back-end specific failure
    Backend,
    /// IO failure
    Io,
    /// Anything else
    Other,
}

impl StatusErrorType {
    /// Classify an adaptor error for embedding in a status.
    pub fn of(err: &AdaptorError) -> Self {
        match err {
            AdaptorError::NoSuchJob(_) | AdaptorError::NoSuchCopy(_) | AdaptorError::NoSuchPath(_) => {
                Self::NotFound
            }
            AdaptorError::JobCancelled(_) | AdaptorError::CopyCancelled(_) => Self::Cancelled,
            AdaptorError::PathAlreadyExists(_) => Self::AlreadyExists,
            AdaptorError::NotConnected(_) => Self::NotConnected,
            AdaptorError::Backend { .. } => Self::Backend,
            AdaptorError::Io(_) => Self::Io,
            _ => Self::Other,
        }
    }
}

/// Failure recorded inside a job or copy status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    /// Classification of the failure
    pub error_type: StatusErrorType,
    /// Human readable message
    pub message: String,
}

impl From<&AdaptorError> for StatusError {
    fn from(err: &AdaptorError) -> Self {
        Self {
            error_type: StatusErrorType::of(err),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_not_found_keeps_path() {
        let err = AdaptorError::from_io(
            std::io::Error::from(std::io::ErrorKind::NotFound),
            "/tmp/missing",
        );
        assert!(matches!(err, AdaptorError::NoSuchPath(ref p) if p == "/tmp/missing"));
    }

    #[test]
    fn test_from_io_other_is_io() {
        let err = AdaptorError::from_io(std::io::Error::other("boom"), "/x");
        assert!(matches!(err, AdaptorError::Io(_)));
    }

    #[test]
    fn test_status_error_type() {
        assert_eq!(
            StatusErrorType::of(&AdaptorError::JobCancelled("j".into())),
            StatusErrorType::Cancelled
        );
        assert_eq!(
            StatusErrorType::of(&AdaptorError::NoSuchJob("j".into())),
            StatusErrorType::NotFound
        );
        assert_eq!(
            StatusErrorType::of(&AdaptorError::InvalidPath("p".into())),
            StatusErrorType::Other
        );
    }
}
