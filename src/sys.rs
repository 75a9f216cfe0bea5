//! Thin wrappers over the platform socket and polling primitives.
//!
//! Everything OS-specific that is not a whole poller backend lives here, so
//! the rest of the crate stays free of `cfg` noise.

use std::io;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Raw socket handle: a file descriptor on POSIX systems.
        pub type Sock = std::os::unix::io::RawFd;

        pub type PollFd = libc::pollfd;

        pub const POLL_READ: i16 = libc::POLLIN | libc::POLLPRI;
        pub const POLL_WRITE: i16 = libc::POLLOUT;
        pub const POLL_ERR: i16 = libc::POLLERR | libc::POLLNVAL;
        pub const POLL_HUP: i16 = libc::POLLHUP;
        pub const POLL_IN: i16 = libc::POLLIN;

        pub fn raw_socket<T: std::os::unix::io::AsRawFd>(t: &T) -> Sock {
            t.as_raw_fd()
        }

        pub fn poll_fd(sock: Sock, events: i16) -> PollFd {
            libc::pollfd { fd: sock, events, revents: 0 }
        }

        pub fn poll_fd_sock(pfd: &PollFd) -> Sock {
            pfd.fd
        }

        pub fn poll(fds: &mut [PollFd], timeout_ms: i32) -> i32 {
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) }
        }

        pub fn close(sock: Sock) {
            unsafe { libc::close(sock) };
        }

        /// Fetches and clears the pending error on a socket (`SO_ERROR`).
        pub fn socket_error(sock: Sock) -> i32 {
            let mut err: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    sock,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc < 0 {
                last_errno()
            } else {
                err
            }
        }

        pub fn set_keepalive(sock: Sock, enabled: bool) -> io::Result<()> {
            let value: libc::c_int = if enabled { 1 } else { 0 };
            let rc = unsafe {
                libc::setsockopt(
                    sock,
                    libc::SOL_SOCKET,
                    libc::SO_KEEPALIVE,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    } else if #[cfg(windows)] {
        /// Raw socket handle: a winsock `SOCKET`.
        pub type Sock = std::os::windows::io::RawSocket;

        #[repr(C)]
        #[derive(Clone, Copy)]
        pub struct PollFd {
            pub fd: usize,
            pub events: i16,
            pub revents: i16,
        }

        // WSAPoll rejects POLLIN/POLLPRI in the interest set; the RDNORM and
        // RDBAND forms must be used instead.
        pub const POLL_READ: i16 = 0x0100 | 0x0200; // POLLRDNORM | POLLRDBAND
        pub const POLL_WRITE: i16 = 0x0010; // POLLWRNORM
        pub const POLL_ERR: i16 = 0x0001 | 0x0004; // POLLERR | POLLNVAL
        pub const POLL_HUP: i16 = 0x0002; // POLLHUP
        pub const POLL_IN: i16 = 0x0100; // POLLRDNORM

        #[link(name = "ws2_32")]
        extern "system" {
            fn WSAPoll(fds: *mut PollFd, nfds: u32, timeout: i32) -> i32;
            fn closesocket(s: usize) -> i32;
        }

        pub fn raw_socket<T: std::os::windows::io::AsRawSocket>(t: &T) -> Sock {
            t.as_raw_socket()
        }

        pub fn poll_fd(sock: Sock, events: i16) -> PollFd {
            PollFd { fd: sock as usize, events, revents: 0 }
        }

        pub fn poll_fd_sock(pfd: &PollFd) -> Sock {
            pfd.fd as Sock
        }

        pub fn poll(fds: &mut [PollFd], timeout_ms: i32) -> i32 {
            unsafe { WSAPoll(fds.as_mut_ptr(), fds.len() as u32, timeout_ms) }
        }

        pub fn close(sock: Sock) {
            unsafe { closesocket(sock as usize) };
        }

        pub fn socket_error(_sock: Sock) -> i32 {
            io::Error::last_os_error().raw_os_error().unwrap_or(0)
        }

        pub fn set_keepalive(_sock: Sock, _enabled: bool) -> io::Result<()> {
            Ok(())
        }
    }
}

pub fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
