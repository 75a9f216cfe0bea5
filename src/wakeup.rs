//! Loopback wakeup primitive used to interrupt a blocking poll from another
//! thread: a pipe pair on POSIX, a connected UDP socket pair on Windows
//! (which has no self-pipe).

use std::io;

use crate::sys::{self, Sock};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub struct Wakeup {
            read_fd: Sock,
            write_fd: Sock,
        }

        impl Wakeup {
            pub fn new() -> io::Result<Wakeup> {
                let mut fds = [0 as libc::c_int; 2];
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "linux")] {
                        let rc = unsafe {
                            libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC)
                        };
                        if rc < 0 {
                            return Err(io::Error::last_os_error());
                        }
                    } else {
                        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
                        if rc < 0 {
                            return Err(io::Error::last_os_error());
                        }
                        for fd in fds {
                            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                            let rc = unsafe {
                                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)
                            };
                            if flags < 0 || rc < 0 {
                                let err = io::Error::last_os_error();
                                unsafe {
                                    libc::close(fds[0]);
                                    libc::close(fds[1]);
                                }
                                return Err(err);
                            }
                        }
                    }
                }
                Ok(Wakeup { read_fd: fds[0], write_fd: fds[1] })
            }

            /// Socket handle the owning loop registers for read interest.
            pub fn sock(&self) -> Sock {
                self.read_fd
            }

            /// One-byte write; a full pipe already guarantees a pending wakeup,
            /// so `EAGAIN` is ignored.
            pub fn notify(&self) {
                let byte = [1u8];
                unsafe { libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1) };
            }

            pub fn drain(&self) {
                let mut buf = [0u8; 64];
                loop {
                    let n = unsafe {
                        libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                    if n <= 0 {
                        break;
                    }
                }
            }
        }

        impl Drop for Wakeup {
            fn drop(&mut self) {
                sys::close(self.read_fd);
                sys::close(self.write_fd);
            }
        }
    } else if #[cfg(windows)] {
        use std::net::UdpSocket;

        pub struct Wakeup {
            reader: UdpSocket,
            writer: UdpSocket,
        }

        impl Wakeup {
            pub fn new() -> io::Result<Wakeup> {
                let reader = UdpSocket::bind("127.0.0.1:0")?;
                let writer = UdpSocket::bind("127.0.0.1:0")?;
                writer.connect(reader.local_addr()?)?;
                reader.set_nonblocking(true)?;
                writer.set_nonblocking(true)?;
                Ok(Wakeup { reader, writer })
            }

            pub fn sock(&self) -> Sock {
                sys::raw_socket(&self.reader)
            }

            pub fn notify(&self) {
                let _ = self.writer.send(&[1u8]);
            }

            pub fn drain(&self) {
                let mut buf = [0u8; 64];
                while self.reader.recv(&mut buf).is_ok() {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_makes_sock_readable() {
        let wakeup = Wakeup::new().unwrap();
        wakeup.notify();
        let mut fds = [sys::poll_fd(wakeup.sock(), sys::POLL_READ)];
        let n = sys::poll(&mut fds, 1000);
        assert_eq!(n, 1);
        assert_ne!(fds[0].revents & sys::POLL_IN, 0);
    }

    #[test]
    fn test_drain_clears_pending_bytes() {
        let wakeup = Wakeup::new().unwrap();
        for _ in 0..10 {
            wakeup.notify();
        }
        wakeup.drain();
        let mut fds = [sys::poll_fd(wakeup.sock(), sys::POLL_READ)];
        let n = sys::poll(&mut fds, 0);
        assert_eq!(n, 0);
    }
}
