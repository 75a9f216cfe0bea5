//! Raw byte-I/O contract between a connection and its socket.
//!
//! The transport is the only layer that touches the socket's read/write
//! syscalls; the connection state machine above it deals purely in
//! [`IoResult`] outcomes and buffers. An encrypted transport plugs in by
//! overriding the four handshake hooks and the read/write pair; the reactor
//! itself never changes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use crate::buffer::Buffer;
use crate::sys::{self, Sock};

/// Outcome of a single transport operation.
///
/// `WouldBlock` and `PeerClosed` are not errors: the first means "nothing more
/// to do this tick", the second is a normal connection-lifecycle event. Only
/// `Err` carries a raw OS error code, and the connection is closed after
/// surfacing it, since retry policy belongs to the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoResult {
    /// Bytes moved (possibly 0 when there was nothing to do).
    Ok(usize),
    WouldBlock,
    PeerClosed,
    Err(i32),
}

pub trait Transport: Send {
    /// Reads into the buffer's writable region until the socket would block,
    /// returning one coalesced byte count. Looping until `EWOULDBLOCK` is what
    /// lets edge-triggered and level-triggered pollers behave identically.
    fn read_some(&mut self, buf: &mut Buffer) -> IoResult;

    /// Writes from the buffer's readable region until the socket would block
    /// or the buffer empties, consuming what was written.
    fn write_some(&mut self, buf: &mut Buffer) -> IoResult;

    /// Half-close: shuts down the write direction, leaving reads open.
    fn shutdown_write(&mut self);

    /// Full close; idempotent.
    fn close(&mut self);

    fn sock(&self) -> Sock;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn need_handshake(&self) -> bool {
        false
    }

    fn handshake(&mut self) -> IoResult {
        IoResult::Ok(0)
    }

    fn handshake_want_read(&self) -> bool {
        false
    }

    fn handshake_want_write(&self) -> bool {
        false
    }
}

const READ_CHUNK: usize = 4096;

/// Plain TCP transport over a non-blocking stream.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    sock: Sock,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    /// EOF observed while delivering earlier bytes; surfaced as `PeerClosed`
    /// on the next read so no data is dropped under edge triggering.
    eof: bool,
}

impl TcpTransport {
    /// Wraps an accepted (or connected) stream, switching it to non-blocking.
    pub fn new(stream: TcpStream) -> io::Result<TcpTransport> {
        stream.set_nonblocking(true)?;
        let sock = sys::raw_socket(&stream);
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        Ok(TcpTransport {
            stream: Some(stream),
            sock,
            peer,
            local,
            eof: false,
        })
    }
}

impl Transport for TcpTransport {
    fn read_some(&mut self, buf: &mut Buffer) -> IoResult {
        if self.eof {
            return IoResult::PeerClosed;
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return IoResult::PeerClosed,
        };
        let mut total = 0;
        loop {
            buf.reserve(READ_CHUNK);
            match stream.read(buf.writable_mut()) {
                Ok(0) => {
                    if total > 0 {
                        self.eof = true;
                        return IoResult::Ok(total);
                    }
                    return IoResult::PeerClosed;
                }
                Ok(n) => {
                    buf.commit(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if total > 0 {
                        IoResult::Ok(total)
                    } else {
                        IoResult::WouldBlock
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return IoResult::Err(e.raw_os_error().unwrap_or(0)),
            }
        }
    }

    fn write_some(&mut self, buf: &mut Buffer) -> IoResult {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return IoResult::PeerClosed,
        };
        let mut total = 0;
        while buf.readable_bytes() > 0 {
            match stream.write(buf.peek()) {
                Ok(0) => break,
                Ok(n) => {
                    buf.consume(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if total > 0 {
                        IoResult::Ok(total)
                    } else {
                        IoResult::WouldBlock
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::BrokenPipe
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    return IoResult::PeerClosed;
                }
                Err(e) => return IoResult::Err(e.raw_os_error().unwrap_or(0)),
            }
        }
        IoResult::Ok(total)
    }

    fn shutdown_write(&mut self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Write);
        }
    }

    fn close(&mut self) {
        self.stream.take();
    }

    fn sock(&self) -> Sock {
        self.sock
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}
