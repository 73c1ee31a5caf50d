//! A connection pool for a client of a remote networked database.
//!
//! A [`Pool`] maintains a bounded set of long-lived sockets to one endpoint,
//! checked out with [`Pool::get_socket`] and returned with
//! [`Pool::maybe_return_socket`]. A caller that needs several checkouts to
//! observe the same connection — for causal consistency within one logical
//! operation — brackets them with [`Pool::start_request`]/[`Pool::end_request`]
//! (or the RAII [`Pool::start_request_scoped`]); every checkout inside that
//! bracket returns the same socket. [`Pool::reset`] invalidates the pool's
//! current generation, e.g. after detecting the server side has restarted.
//!
//! Sockets are closed and discarded, never reused, across a process fork; the
//! pool detects this on the next checkout without requiring the caller to do
//! anything.

mod config;
mod connector;
mod error;
mod identity;
mod pool;
mod socket;

pub use config::{ConcurrencyMode, Endpoint, PoolConfig};
pub use error::{Error, ErrorKind, Result};
pub use pool::{Pool, RequestGuard};
pub use socket::SocketHandle;

#[cfg(feature = "task-identity")]
pub use pool::task_scope;
