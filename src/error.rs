//! Contains the `Error` and `Result` types that `sockpool` uses.

use std::sync::Arc;

use thiserror::Error;

/// The result type for all fallible operations in the `sockpool` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while constructing or operating a [`Pool`](crate::Pool).
///
/// The inner [`ErrorKind`] is wrapped in an `Arc` so `Error` stays cheaply cloneable.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    /// The kind of error that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Whether this error is a [`ErrorKind::Config`].
    pub fn is_config_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Config { .. })
    }

    /// Whether this error is a [`ErrorKind::Connect`].
    pub fn is_connect_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Connect { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config {
            message: message.into(),
        })
    }

    pub(crate) fn connect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connect {
            message: message.into(),
            source: None,
        })
    }

    pub(crate) fn connect_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Connect {
            message: message.into(),
            source: Some(Arc::new(source)),
        })
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// The kinds of errors that can occur in the `sockpool` crate.
///
/// Construction-time misconfiguration surfaces as [`ErrorKind::Config`]; every runtime
/// failure to produce a usable socket (DNS, TCP connect, TLS handshake, reconnect during
/// a health check) surfaces as [`ErrorKind::Connect`]. There are no other error kinds:
/// socket I/O errors observed during the checkout readability probe are interpreted as
/// staleness and drive a reconnect rather than being surfaced (see [`crate::Pool::get_socket`]).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Construction-time misconfiguration: TLS requested but the `tls` feature is
    /// disabled, or a Unix-domain endpoint requested on a platform without
    /// `AF_UNIX` support.
    #[error("invalid pool configuration: {message}")]
    #[non_exhaustive]
    Config { message: String },

    /// A runtime failure to produce a usable, connected socket.
    #[error("failed to connect: {message}")]
    #[non_exhaustive]
    Connect {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },
}
