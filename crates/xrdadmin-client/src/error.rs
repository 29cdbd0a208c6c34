//! Admin error type and its closed kind enumeration.

use thiserror::Error;
use xrdadmin_transport::message::{ErrorCode, ErrorReply};
use xrdadmin_transport::{CancelReason, ServerAddr, TransportError};

/// Closed classification of every admin failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Path does not exist.
    NotFound,
    /// Target already exists.
    AlreadyExists,
    /// A directory was required.
    NotADirectory,
    /// Directory still has entries.
    NotEmpty,
    /// Caller lacks the rights.
    PermissionDenied,
    /// No server in the chain responded.
    Unreachable,
    /// Resolution exceeded the hop bound.
    RedirectLoop,
    /// No reply in time.
    Timeout,
    /// Cancelled before completion.
    Cancelled,
    /// Operation not meaningful for the target.
    Unsupported,
    /// Path failed syntactic validation.
    InvalidPath,
    /// Call argument rejected before any I/O.
    InvalidArgument,
    /// Malformed or unexpected reply, or a server-internal failure.
    Protocol,
}

impl ErrorKind {
    /// Failures reported by the cluster about the target itself. Never retried.
    pub fn is_semantic(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound
                | ErrorKind::AlreadyExists
                | ErrorKind::NotADirectory
                | ErrorKind::NotEmpty
                | ErrorKind::PermissionDenied
                | ErrorKind::Unsupported
        )
    }

    /// Transport-level failures that were retried before surfacing.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Unreachable | ErrorKind::Timeout)
    }
}

/// Errors returned by admin operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdminError {
    /// The path does not exist anywhere in the namespace.
    #[error("{path}: not found")]
    NotFound {
        /// Logical path
        path: String,
    },

    /// Something already exists at the path.
    #[error("{path}: already exists")]
    AlreadyExists {
        /// Logical path
        path: String,
    },

    /// The path (or one of its parents) is not a directory.
    #[error("{path}: not a directory")]
    NotADirectory {
        /// Logical path
        path: String,
    },

    /// The directory still has entries.
    #[error("{path}: directory not empty")]
    NotEmpty {
        /// Logical path
        path: String,
    },

    /// The caller lacks the rights for the operation or the login was refused.
    #[error("{target}: permission denied: {message}")]
    PermissionDenied {
        /// Path or server
        target: String,
        /// Server-provided detail
        message: String,
    },

    /// No server in the chain responded.
    #[error("unreachable: {server}: {reason}")]
    Unreachable {
        /// Last server tried
        server: String,
        /// Transport failure
        reason: String,
    },

    /// Resolution exceeded the hop bound.
    #[error("{path}: redirect loop after {hops} hops")]
    RedirectLoop {
        /// Logical path
        path: String,
        /// Hops followed
        hops: u32,
    },

    /// No reply within the timeout or deadline.
    #[error("timed out: {detail}")]
    Timeout {
        /// What timed out
        detail: String,
    },

    /// Cancelled before completion.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why
        reason: CancelReason,
    },

    /// The operation is not meaningful for the target.
    #[error("{path}: unsupported: {message}")]
    Unsupported {
        /// Logical path
        path: String,
        /// Detail
        message: String,
    },

    /// The path failed validation.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// Rejected text
        path: String,
        /// What is wrong with it
        reason: String,
    },

    /// A call argument was rejected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed or unexpected reply, or a server-internal failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result alias for admin operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    /// Kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdminError::NotFound { .. } => ErrorKind::NotFound,
            AdminError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            AdminError::NotADirectory { .. } => ErrorKind::NotADirectory,
            AdminError::NotEmpty { .. } => ErrorKind::NotEmpty,
            AdminError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            AdminError::Unreachable { .. } => ErrorKind::Unreachable,
            AdminError::RedirectLoop { .. } => ErrorKind::RedirectLoop,
            AdminError::Timeout { .. } => ErrorKind::Timeout,
            AdminError::Cancelled { .. } => ErrorKind::Cancelled,
            AdminError::Unsupported { .. } => ErrorKind::Unsupported,
            AdminError::InvalidPath { .. } => ErrorKind::InvalidPath,
            AdminError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AdminError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Maps a server `Error` reply about `path`.
    pub fn from_reply(reply: ErrorReply, path: &str) -> Self {
        let path = path.to_string();
        match reply.code {
            ErrorCode::NotFound => AdminError::NotFound { path },
            ErrorCode::AlreadyExists => AdminError::AlreadyExists { path },
            ErrorCode::NotADirectory => AdminError::NotADirectory { path },
            ErrorCode::NotEmpty => AdminError::NotEmpty { path },
            ErrorCode::PermissionDenied => AdminError::PermissionDenied {
                target: path,
                message: reply.message,
            },
            ErrorCode::IsADirectory | ErrorCode::Unsupported => AdminError::Unsupported {
                path,
                message: reply.message,
            },
            ErrorCode::InvalidRequest => AdminError::InvalidArgument(reply.message),
            ErrorCode::ServerError => {
                AdminError::Protocol(format!("{}: server error: {}", path, reply.message))
            }
        }
    }

    /// Maps a transport failure talking to `server`.
    ///
    /// A deadline that expires during a single operation surfaces as
    /// `Timeout`; explicit cancellation stays `Cancelled`.
    pub fn from_transport(err: TransportError, server: &ServerAddr) -> Self {
        match err {
            TransportError::ConnectionRefused { .. }
            | TransportError::ConnectionTimeout { .. }
            | TransportError::ConnectionReset
            | TransportError::NotConnected
            | TransportError::IoError(_) => AdminError::Unreachable {
                server: server.to_string(),
                reason: err.to_string(),
            },
            TransportError::RequestTimeout { timeout_ms, .. } => AdminError::Timeout {
                detail: format!("{} did not answer within {}ms", server, timeout_ms),
            },
            TransportError::Cancelled {
                reason: CancelReason::DeadlineExceeded,
            } => AdminError::Timeout {
                detail: format!("deadline exceeded waiting for {}", server),
            },
            TransportError::Cancelled { reason } => AdminError::Cancelled { reason },
            TransportError::LoginRejected { message, .. } => AdminError::PermissionDenied {
                target: server.to_string(),
                message,
            },
            other => AdminError::Protocol(format!("{}: {}", server, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerAddr {
        ServerAddr::new("mgr", 1094)
    }

    #[test]
    fn test_reply_codes_map_to_kinds() {
        let cases = [
            (ErrorCode::NotFound, ErrorKind::NotFound),
            (ErrorCode::AlreadyExists, ErrorKind::AlreadyExists),
            (ErrorCode::NotADirectory, ErrorKind::NotADirectory),
            (ErrorCode::NotEmpty, ErrorKind::NotEmpty),
            (ErrorCode::IsADirectory, ErrorKind::Unsupported),
            (ErrorCode::PermissionDenied, ErrorKind::PermissionDenied),
            (ErrorCode::Unsupported, ErrorKind::Unsupported),
            (ErrorCode::InvalidRequest, ErrorKind::InvalidArgument),
            (ErrorCode::ServerError, ErrorKind::Protocol),
        ];
        for (code, kind) in cases {
            let err = AdminError::from_reply(
                ErrorReply {
                    code,
                    message: String::new(),
                },
                "/store/a.root",
            );
            assert_eq!(err.kind(), kind, "{:?}", code);
        }
    }

    #[test]
    fn test_transport_errors_map_to_kinds() {
        let refused = TransportError::ConnectionRefused {
            addr: "mgr:1094".to_string(),
        };
        assert_eq!(
            AdminError::from_transport(refused, &server()).kind(),
            ErrorKind::Unreachable
        );

        let timeout = TransportError::RequestTimeout {
            request_id: 3,
            timeout_ms: 100,
        };
        assert_eq!(
            AdminError::from_transport(timeout, &server()).kind(),
            ErrorKind::Timeout
        );

        let deadline = TransportError::Cancelled {
            reason: CancelReason::DeadlineExceeded,
        };
        assert_eq!(
            AdminError::from_transport(deadline, &server()).kind(),
            ErrorKind::Timeout
        );

        let user = TransportError::Cancelled {
            reason: CancelReason::UserRequested,
        };
        assert_eq!(
            AdminError::from_transport(user, &server()),
            AdminError::Cancelled {
                reason: CancelReason::UserRequested
            }
        );

        let login = TransportError::LoginRejected {
            addr: "mgr:1094".to_string(),
            message: "bad token".to_string(),
        };
        assert_eq!(
            AdminError::from_transport(login, &server()).kind(),
            ErrorKind::PermissionDenied
        );

        let garbage = TransportError::SerializationError("eof".to_string());
        assert_eq!(
            AdminError::from_transport(garbage, &server()).kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_propagation_classes() {
        assert!(ErrorKind::NotFound.is_semantic());
        assert!(ErrorKind::PermissionDenied.is_semantic());
        assert!(!ErrorKind::NotFound.is_transient());
        assert!(ErrorKind::Unreachable.is_transient());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(!ErrorKind::Cancelled.is_semantic());
        assert!(!ErrorKind::Cancelled.is_transient());
    }
}
