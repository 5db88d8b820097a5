//! Classification of adaptor failures into wire-level error kinds.

use skiff::AdaptorError;
use thiserror::Error;
use tonic::{Code, Status};

/// Result type used by the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Stable failure categories reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown path, job, queue, adaptor, handle or operation
    NotFound,
    /// Duplicate handle or path collision
    AlreadyExists,
    /// Malformed or missing request field
    InvalidArgument,
    /// Back end reachable but session not connected
    Unavailable,
    /// Request is well formed but not acceptable in the current state
    FailedPrecondition,
    /// Operation not supported by the back end
    Unimplemented,
    /// The work product was cancelled
    Cancelled,
    /// Back-end specific failure with no finer classification
    Generic,
    /// Anything unexpected, including unclassified I/O faults
    Internal,
}

impl ErrorKind {
    /// gRPC status code carrying this kind.
    pub fn code(self) -> Code {
        match self {
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::Unavailable => Code::Unavailable,
            ErrorKind::FailedPrecondition => Code::FailedPrecondition,
            ErrorKind::Unimplemented => Code::Unimplemented,
            ErrorKind::Cancelled => Code::Cancelled,
            ErrorKind::Generic => Code::Unknown,
            ErrorKind::Internal => Code::Internal,
        }
    }
}

/// Kind of an adaptor failure.
///
/// The match is exhaustive, so adding an [`AdaptorError`] variant does not
/// compile until it is classified here.
pub fn classify(err: &AdaptorError) -> ErrorKind {
    match err {
        AdaptorError::NoSuchPath(_)
        | AdaptorError::UnknownAdaptor(_)
        | AdaptorError::UnknownProperty(_)
        | AdaptorError::NoSuchQueue(_)
        | AdaptorError::NoSuchJob(_)
        | AdaptorError::NoSuchCopy(_) => ErrorKind::NotFound,

        AdaptorError::PathAlreadyExists(_) => ErrorKind::AlreadyExists,

        AdaptorError::IncompleteJobDescription(_) | AdaptorError::InvalidArgument(_) => {
            ErrorKind::InvalidArgument
        }

        AdaptorError::NotConnected(_) => ErrorKind::Unavailable,

        AdaptorError::InvalidPath(_)
        | AdaptorError::DirectoryNotEmpty(_)
        | AdaptorError::InvalidProperty { .. }
        | AdaptorError::InvalidCredential(_)
        | AdaptorError::InvalidLocation(_)
        | AdaptorError::InvalidJobDescription(_) => ErrorKind::FailedPrecondition,

        AdaptorError::UnsupportedOperation { .. } | AdaptorError::UnsupportedJobDescription(_) => {
            ErrorKind::Unimplemented
        }

        AdaptorError::JobCancelled(_) | AdaptorError::CopyCancelled(_) => ErrorKind::Cancelled,

        AdaptorError::Backend { .. } => ErrorKind::Generic,

        AdaptorError::Io(_) => ErrorKind::Internal,
    }
}

/// A classified failure ready to be sent to a client.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GatewayError {
    /// Failure category
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
}

impl GatewayError {
    /// Build an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for [`ErrorKind::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Shorthand for [`ErrorKind::AlreadyExists`].
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    /// Shorthand for [`ErrorKind::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// Shorthand for [`ErrorKind::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<AdaptorError> for GatewayError {
    fn from(err: AdaptorError) -> Self {
        Self::from(&err)
    }
}

impl From<&AdaptorError> for GatewayError {
    fn from(err: &AdaptorError) -> Self {
        Self::new(classify(err), err.to_string())
    }
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        Status::new(err.kind.code(), err.message)
    }
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("blocking task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_family() {
        for err in [
            AdaptorError::NoSuchPath("/x".into()),
            AdaptorError::UnknownAdaptor("ftp".into()),
            AdaptorError::UnknownProperty("p".into()),
            AdaptorError::NoSuchQueue("q".into()),
            AdaptorError::NoSuchJob("j".into()),
            AdaptorError::NoSuchCopy("c".into()),
        ] {
            assert_eq!(classify(&err), ErrorKind::NotFound, "{err}");
        }
    }

    #[test]
    fn test_precondition_and_argument_kinds() {
        assert_eq!(
            classify(&AdaptorError::DirectoryNotEmpty("/d".into())),
            ErrorKind::FailedPrecondition
        );
        assert_eq!(
            classify(&AdaptorError::InvalidCredential("c".into())),
            ErrorKind::FailedPrecondition
        );
        assert_eq!(
            classify(&AdaptorError::IncompleteJobDescription("exe".into())),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            classify(&AdaptorError::unsupported("file", "copy")),
            ErrorKind::Unimplemented
        );
        assert_eq!(
            classify(&AdaptorError::NotConnected("closed".into())),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn test_generic_and_internal() {
        assert_eq!(
            classify(&AdaptorError::backend("local", "boom")),
            ErrorKind::Generic
        );
        assert_eq!(
            classify(&AdaptorError::Io(std::io::Error::other("disk"))),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_status_keeps_message() {
        let status = Status::from(GatewayError::from(AdaptorError::NoSuchPath(
            "/tmp/gone".into(),
        )));
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("/tmp/gone"));

        let status = Status::from(GatewayError::from(AdaptorError::backend("local", "x")));
        assert_eq!(status.code(), Code::Unknown);
    }
}
