use std::net::SocketAddr;

use thiserror::Error;

use crate::net::server::ServerStatus;
use crate::sys::Sock;

/// The error type for sluice-io operations.
///
/// Covers socket setup, poller registration, and server lifecycle failures.
/// Per-connection I/O outcomes (`WouldBlock`, peer close, raw OS errors) are
/// not represented here; they travel through
/// [`IoResult`](crate::net::transport::IoResult) and the connection callbacks
/// instead, because they are normal connection-lifecycle signals rather than
/// failures of the reactor itself.
#[derive(Error, Debug)]
pub enum Error {
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A listen address could not be parsed.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    /// Binding a listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// A poller add/modify/delete syscall failed for a channel.
    ///
    /// The caller owns rollback: the offending socket is closed and the loop
    /// keeps serving every other channel.
    #[error("poller registration failed for socket {sock}: {source}")]
    Registration {
        sock: Sock,
        source: std::io::Error,
    },

    /// An event loop was started from a second thread after being pinned.
    #[error("event loop is already pinned to another thread")]
    LoopBusy,

    /// A server lifecycle operation was issued in the wrong status.
    #[error("server is {current:?}, cannot {operation}")]
    State {
        current: ServerStatus,
        operation: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
