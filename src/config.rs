use std::{path::PathBuf, time::Duration};

use typed_builder::TypedBuilder;

/// The address a [`Pool`](crate::Pool) connects to.
///
/// A string ending in `.sock` denotes a Unix-domain path; everything else is a
/// `(host, port)` pair, where `host` may be a DNS name, an IPv4 literal, or an IPv6
/// literal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// A TCP endpoint.
    Tcp { host: String, port: u16 },

    /// A Unix-domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Creates a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Creates a Unix-domain endpoint from a path ending in `.sock`.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }
}

/// Selects how the pool identifies "the current caller" for request pinning.
///
/// The original pool (pymongo) supported pinning sockets to either the current OS
/// thread or the current greenlet. Rust has no greenlet runtime, but `tokio` tasks
/// play the same role: independently-identified units of cooperatively-scheduled
/// execution. `PerTask` requires the `task-identity` feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// Pin sockets to the current OS thread (the default).
    #[default]
    PerThread,

    /// Pin sockets to the current `tokio` task. Callers must run inside
    /// [`crate::task_scope`].
    #[cfg(feature = "task-identity")]
    PerTask,
}

/// Construction parameters for a [`Pool`](crate::Pool).
#[derive(Debug, TypedBuilder)]
pub struct PoolConfig {
    /// The default endpoint used when a caller does not override it per-call.
    pub endpoint: Endpoint,

    /// Upper bound on the idle set's size. Soft: concurrent checkouts can
    /// temporarily exceed it, but `maybe_return_socket` never lets `idle` grow past it.
    #[builder(default = 2)]
    pub max_idle: usize,

    /// Timeout applied to the connector's connect attempt. Defaults to 20s, matching
    /// the original pool's default.
    #[builder(default = Duration::from_secs(20))]
    pub connect_timeout: Duration,

    /// Read/write timeout applied to handed-out sockets. `None` means no timeout.
    #[builder(default)]
    pub io_timeout: Option<Duration>,

    /// Wrap connections in a TLS handshake. Requires the `tls` feature; otherwise
    /// pool construction fails with `ErrorKind::Config`.
    #[builder(default)]
    pub use_tls: bool,

    /// How the pool identifies the current caller.
    #[builder(default)]
    pub concurrency_mode: ConcurrencyMode,
}
