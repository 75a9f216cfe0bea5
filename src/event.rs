use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};

/// Readiness bitmask shared by channels, pollers, and connections.
///
/// Pollers translate OS-specific readiness bits into this vocabulary so the
/// rest of the reactor never sees `EPOLL*`/`POLL*` constants.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IoEvent(u8);

impl IoEvent {
    pub const NONE: IoEvent = IoEvent(0);
    pub const READ: IoEvent = IoEvent(1 << 0);
    pub const WRITE: IoEvent = IoEvent(1 << 1);
    pub const CLOSE: IoEvent = IoEvent(1 << 2);
    pub const TIMEOUT: IoEvent = IoEvent(1 << 3);
    pub const ERROR: IoEvent = IoEvent(1 << 4);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: IoEvent) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(IoEvent::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(IoEvent::WRITE)
    }

    pub fn is_close(self) -> bool {
        self.contains(IoEvent::CLOSE)
    }

    pub fn is_timeout(self) -> bool {
        self.contains(IoEvent::TIMEOUT)
    }

    pub fn is_error(self) -> bool {
        self.contains(IoEvent::ERROR)
    }
}

impl BitOr for IoEvent {
    type Output = IoEvent;

    fn bitor(self, rhs: IoEvent) -> IoEvent {
        IoEvent(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoEvent {
    fn bitor_assign(&mut self, rhs: IoEvent) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for IoEvent {
    type Output = IoEvent;

    fn bitand(self, rhs: IoEvent) -> IoEvent {
        IoEvent(self.0 & rhs.0)
    }
}

impl BitAndAssign for IoEvent {
    fn bitand_assign(&mut self, rhs: IoEvent) {
        self.0 &= rhs.0;
    }
}

impl std::ops::Not for IoEvent {
    type Output = IoEvent;

    fn not(self) -> IoEvent {
        IoEvent(!self.0)
    }
}

impl fmt::Debug for IoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut first = true;
        for (flag, name) in [
            (IoEvent::READ, "READ"),
            (IoEvent::WRITE, "WRITE"),
            (IoEvent::CLOSE, "CLOSE"),
            (IoEvent::TIMEOUT, "TIMEOUT"),
            (IoEvent::ERROR, "ERROR"),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_and_intersection() {
        let rw = IoEvent::READ | IoEvent::WRITE;
        assert!(rw.is_readable());
        assert!(rw.is_writable());
        assert!(!rw.is_error());
        assert_eq!(rw & IoEvent::READ, IoEvent::READ);
        assert_eq!(rw & IoEvent::CLOSE, IoEvent::NONE);
    }

    #[test]
    fn test_mask_removal() {
        let mut ev = IoEvent::READ | IoEvent::WRITE | IoEvent::ERROR;
        ev &= !IoEvent::WRITE;
        assert!(ev.is_readable());
        assert!(!ev.is_writable());
        assert!(ev.is_error());
    }

    #[test]
    fn test_contains_requires_all_bits() {
        let ev = IoEvent::READ | IoEvent::CLOSE;
        assert!(ev.contains(IoEvent::READ));
        assert!(!ev.contains(IoEvent::READ | IoEvent::WRITE));
    }

    #[test]
    fn test_debug_lists_flags() {
        assert_eq!(format!("{:?}", IoEvent::NONE), "NONE");
        assert_eq!(format!("{:?}", IoEvent::READ | IoEvent::ERROR), "READ|ERROR");
    }
}
