// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// Classification of a connect-path outcome.
///
/// Every failing operation in the connect subsystem reduces to one of these
/// kinds. The kind is what callers dispatch on; the full context (errno,
/// failing site, message) travels in [`ConnectError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ErrorKind {
    /// A resolver returned a transient failure, or the readiness poll hit
    /// its deadline.
    #[error("operation timed out")]
    Timeout,
    /// A TCP or Unix-domain connect failed outright.
    #[error("connection failure")]
    ConnectionFailure,
    /// The resolver returned a definitive lookup error.
    #[error("host lookup failure")]
    HostLookupFailure,
    /// The resolver rejected the lookup hints.
    #[error("invalid arguments")]
    InvalidArguments,
    /// The resolver or the poll ran out of memory-like resources.
    #[error("memory allocation failure")]
    MemoryAllocationFailure,
    /// The server was auto-ejected from the distribution during backoff.
    #[error("server marked dead")]
    ServerMarkedDead,
    /// The server is sitting out its dead-timeout cooldown.
    #[error("server temporarily disabled")]
    ServerTemporarilyDisabled,
    /// The requested protocol combination is not valid, e.g. SASL over UDP.
    #[error("invalid host protocol")]
    InvalidHostProtocol,
    /// The platform cannot provide the requested transport.
    #[error("operation not supported")]
    NotSupported,
    /// An operating system call failed; the errno is carried alongside.
    #[error("system error")]
    SystemError,
}

/// An error produced while establishing a connection to a server.
///
/// Carries the [`ErrorKind`], the errno when one was involved, the source
/// location that raised the error, and an optional message. A copy of the
/// most recent `ConnectError` is also stored on the failing
/// [`Server`](crate::server::Server) so callers can query it after the fact.
#[derive(Clone, Debug)]
pub struct ConnectError {
    kind: ErrorKind,
    errno: Option<i32>,
    location: &'static Location<'static>,
    message: Option<String>,
}

impl ConnectError {
    /// Create an error of the given kind, tagged with the caller's location.
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        ConnectError {
            kind,
            errno: None,
            location: Location::caller(),
            message: None,
        }
    }

    /// Attach an errno to the error.
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Attach a human-readable message to the error.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    /// The source location that raised the error.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.kind)?;
        if let Some(errno) = self.errno {
            write!(fmt, " (os error {})", errno)?;
        }
        if let Some(message) = &self.message {
            write!(fmt, ": {}", message)?;
        }
        write!(fmt, ", at {}", self.location)
    }
}

impl std::error::Error for ConnectError {}

pub type ConnectResult<T> = Result<T, ConnectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_context() {
        let err = ConnectError::new(ErrorKind::SystemError)
            .with_errno(111)
            .with_message("connect(2)");
        let rendered = err.to_string();
        assert!(rendered.contains("system error"));
        assert!(rendered.contains("os error 111"));
        assert!(rendered.contains("connect(2)"));
        assert!(rendered.contains("error.rs"));
    }

    #[test]
    fn error_kind_is_queryable() {
        let err = ConnectError::new(ErrorKind::Timeout);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.errno().is_none());
        assert!(err.message().is_none());
    }
}
