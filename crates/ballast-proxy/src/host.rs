//! The host I/O boundary.
//!
//! The proxy engine is an explicit state machine: it owns no sockets and
//! performs no I/O itself. A *host* owns the real (or simulated) sockets,
//! hands out opaque [`SocketId`] handles, feeds the engine [`IoEvent`]s and
//! executes the engine's [`HostIo`] calls. Everything for one listener runs
//! on one logical scheduler; handlers run to completion and never block.
//!
//! Two hosts exist: the tokio-backed [`crate::net`] driver for production
//! and the deterministic [`crate::sim`] host for tests.

use std::net::SocketAddr;

use ballast_common::Result;

/// Opaque handle to a host-owned socket.
///
/// Handles are never reused within one host's lifetime, so a stale handle
/// held across a close identifies nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

/// An I/O edge delivered to the engine.
///
/// The stream carries no message boundaries: `Data` chunks slice the byte
/// stream arbitrarily and may contain any number of partial or complete
/// frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    /// The listener accepted a client connection.
    Accepted { socket: SocketId, peer: SocketAddr },
    /// An engine-initiated connect completed.
    ConnectSucceeded { socket: SocketId },
    /// An engine-initiated connect failed.
    ConnectFailed { socket: SocketId },
    /// Bytes arrived on a socket.
    Data { socket: SocketId, bytes: Vec<u8> },
    /// A socket the engine asked to watch can accept more bytes.
    Writable { socket: SocketId, available: usize },
    /// The peer closed the connection.
    Closed { socket: SocketId },
    /// The socket failed. Terminal; indistinguishable from `Closed` for
    /// cleanup purposes.
    Error { socket: SocketId },
}

impl IoEvent {
    /// The socket this event concerns.
    pub fn socket(&self) -> SocketId {
        match self {
            IoEvent::Accepted { socket, .. }
            | IoEvent::ConnectSucceeded { socket }
            | IoEvent::ConnectFailed { socket }
            | IoEvent::Data { socket, .. }
            | IoEvent::Writable { socket, .. }
            | IoEvent::Closed { socket }
            | IoEvent::Error { socket } => *socket,
        }
    }
}

/// Non-blocking socket operations the engine may invoke from any handler.
pub trait HostIo {
    /// Monotonic clock in nanoseconds.
    fn now_ns(&self) -> i64;

    /// Starts accepting on `port`. Accepted connections arrive as
    /// [`IoEvent::Accepted`].
    fn listen(&mut self, port: u16) -> Result<()>;

    /// Initiates a TCP connect. The outcome arrives later as
    /// [`IoEvent::ConnectSucceeded`] or [`IoEvent::ConnectFailed`].
    fn connect(&mut self, address: SocketAddr) -> Result<SocketId>;

    /// Attempts a non-blocking send.
    ///
    /// Returns the number of bytes accepted (possibly short, possibly 0
    /// when the socket can take nothing right now), or a negative value on
    /// a hard error.
    fn send(&mut self, socket: SocketId, bytes: &[u8]) -> isize;

    /// Requests a single [`IoEvent::Writable`] once `socket` can accept
    /// bytes again. Used after a short write.
    fn notify_writable(&mut self, socket: SocketId);

    /// Enables or disables read delivery for `socket`. Re-enabling triggers
    /// an immediate readiness check, so bytes that arrived while reads were
    /// off are delivered promptly.
    fn set_read_enabled(&mut self, socket: SocketId, enabled: bool);

    /// Closes a socket. Idempotent; no further events are delivered for it.
    fn close(&mut self, socket: SocketId);
}
