//! The socket handle the pool hands out, and the stream it wraps.
//!
//! Grounded on `pymongo/pool.py`'s `SocketInfo`: a thin wrapper around the raw
//! socket carrying `pool_id` (for generation checks), `last_checkin_time`
//! (renamed `last_checkout` here, stamped on both checkout and checkin), and an
//! `authset`. `SocketInfo.__eq__`/`__hash__` compare by the wrapped socket's
//! identity, not by value; here that identity is a monotonic `id` assigned at
//! construction, since comparing trait-object streams by pointer would require
//! unsafe code this crate has no other reason to carry.

use std::{
    collections::HashSet,
    fmt,
    io::{self, Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use tracing::trace;

/// The raw, unencrypted transport under a [`SocketHandle`].
pub(crate) enum RawStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for RawStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for RawStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
        }
    }
}

impl RawStream {
    /// Shuts down both halves of the underlying fd so the peer sees the
    /// connection end immediately, regardless of how many `SocketHandle`
    /// clones still reference it.
    fn shutdown(&self) {
        let result = match self {
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
        if let Err(e) = result {
            // Already disconnected is the common case (peer closed first);
            // anything else is not actionable from here.
            trace!("shutdown of a closed socket: {e}");
        }
    }
}

/// The transport a [`SocketHandle`] wraps: plain, or TLS-encrypted over a plain
/// stream.
pub(crate) enum Stream {
    Plain(RawStream),
    #[cfg(feature = "tls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, RawStream>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            Self::Tls(s) => s.flush(),
        }
    }
}

impl Stream {
    fn shutdown(&self) {
        match self {
            Self::Plain(s) => s.shutdown(),
            #[cfg(feature = "tls")]
            Self::Tls(s) => s.sock.shutdown(),
        }
    }
}

pub(crate) struct SocketState {
    id: u64,
    /// The pool generation this socket was created under; compared against the
    /// pool's current generation on checkout to decide staleness after a reset.
    pub(crate) pool_id: u64,
    pub(crate) created: Instant,
    pub(crate) stream: Mutex<Stream>,
    pub(crate) last_checkout: Mutex<Instant>,
    closed: AtomicBool,
    authset: Mutex<HashSet<String>>,
}

/// A handle to one pooled connection.
///
/// Cloning a `SocketHandle` shares the same underlying socket; this is how a
/// caller holding the handle from a pinned request and the pool's own pinned
/// bookkeeping can both refer to "the same connection" without either of them
/// owning it outright, mirroring `SocketInfo` being the same Python object
/// reachable from both `Pool._tid_to_sock` and the caller's local variable.
#[derive(Clone)]
pub struct SocketHandle(pub(crate) Arc<SocketState>);

impl SocketHandle {
    pub(crate) fn new(id: u64, pool_id: u64, stream: Stream) -> Self {
        Self(Arc::new(SocketState {
            id,
            pool_id,
            created: Instant::now(),
            stream: Mutex::new(stream),
            last_checkout: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            authset: Mutex::new(HashSet::new()),
        }))
    }

    /// The pool generation this socket was established under.
    pub(crate) fn pool_id(&self) -> u64 {
        self.0.pool_id
    }

    /// Stamps the checkout/checkin time to now.
    pub(crate) fn touch(&self) {
        *self.0.last_checkout.lock().unwrap() = Instant::now();
    }

    /// Whether this socket has been closed. Closed sockets are never returned to
    /// the idle set and never handed out again.
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// How long since this socket was last handed out or returned.
    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.0.last_checkout.lock().unwrap().elapsed()
    }

    /// How long ago this socket was established.
    pub fn age(&self) -> std::time::Duration {
        self.0.created.elapsed()
    }

    /// Closes the underlying transport. Idempotent: only the call that flips
    /// `closed` from false to true actually shuts the socket down, so the
    /// peer sees the connection end promptly even if other `SocketHandle`
    /// clones (e.g. one the caller still holds after `discard_socket`) keep
    /// the fd itself alive a while longer.
    pub(crate) fn close(&self) {
        if !self.0.closed.swap(true, Ordering::AcqRel) {
            self.0.stream.lock().unwrap().shutdown();
        }
    }

    /// The set of authentication contexts established on this socket.
    ///
    /// Opaque to the pool: it is never inspected or cleared here, including
    /// across a [`crate::Pool::reset`] (a reset socket is closed, never reused,
    /// so a stale authset can never resurface).
    pub fn authset(&self) -> HashSet<String> {
        self.0.authset.lock().unwrap().clone()
    }

    /// Mutates the authentication-context set under the handle's own lock.
    pub fn with_authset_mut<R>(&self, f: impl FnOnce(&mut HashSet<String>) -> R) -> R {
        f(&mut self.0.authset.lock().unwrap())
    }

    /// Whether the underlying socket still appears readable-but-empty (i.e. not
    /// stale). A zero-length read (EOF) or any error means the peer closed the
    /// connection while it sat idle.
    pub(crate) fn looks_alive(&self) -> bool {
        match &mut *self.0.stream.lock().unwrap() {
            Stream::Plain(RawStream::Tcp(s)) => tcp_readable(s),
            #[cfg(unix)]
            Stream::Plain(RawStream::Unix(s)) => unix_readable(s),
            #[cfg(feature = "tls")]
            Stream::Tls(_) => true,
        }
    }
}

fn tcp_readable(stream: &TcpStream) -> bool {
    use std::io::ErrorKind;

    let original_timeout = stream.read_timeout().ok().flatten();
    let _ = stream.set_nonblocking(true);
    let mut buf = [0u8; 1];
    let result = match stream.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::WouldBlock => true,
        Err(_) => false,
    };
    let _ = stream.set_nonblocking(false);
    if let Some(timeout) = original_timeout {
        let _ = stream.set_read_timeout(Some(timeout));
    }
    result
}

#[cfg(unix)]
fn unix_readable(stream: &UnixStream) -> bool {
    use std::{
        io::ErrorKind,
        mem::ManuallyDrop,
        os::fd::{AsRawFd, FromRawFd},
    };

    // `UnixStream::peek` is unstable; borrow the fd as a `socket2::Socket` just
    // long enough to do a `MSG_PEEK` recv, without letting it close the fd.
    let borrowed = ManuallyDrop::new(unsafe { socket2::Socket::from_raw_fd(stream.as_raw_fd()) });

    let original_timeout = stream.read_timeout().ok().flatten();
    let _ = stream.set_nonblocking(true);
    let mut buf = [std::mem::MaybeUninit::uninit(); 1];
    let result = match borrowed.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::WouldBlock => true,
        Err(_) => false,
    };
    let _ = stream.set_nonblocking(false);
    if let Some(timeout) = original_timeout {
        let _ = stream.set_read_timeout(Some(timeout));
    }
    result
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.0.id)
            .field("pool_id", &self.0.pool_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for SocketHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for SocketHandle {}

impl std::hash::Hash for SocketHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl Read for SocketHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.stream.lock().unwrap().read(buf)
    }
}

impl Write for SocketHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.stream.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.stream.lock().unwrap().flush()
    }
}
