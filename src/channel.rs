use crate::event::IoEvent;
use crate::sys::Sock;

/// Poller-private registration state for a channel.
///
/// Pollers key their add/modify/delete decision off this index so that the OS
/// registration and the poller's own bookkeeping can never diverge: every
/// interest change flows through the same
/// [`plan_update`](crate::poller::plan_update) code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelIndex {
    /// Never registered with a poller.
    New,
    /// Currently registered.
    Added,
    /// Was registered, then its interest emptied and the OS entry was removed.
    Deleted,
}

/// Per-socket registration record: the socket handle, the interest set its
/// owner wants notifications for, and the readiness last observed by a poller.
///
/// A channel is registered with at most one poller at a time, and never
/// outlives the connection (or listener) that owns it: ownership always runs
/// from owner to channel, never the reverse.
pub struct Channel {
    sock: Sock,
    interest: IoEvent,
    ready: IoEvent,
    index: ChannelIndex,
}

impl Channel {
    pub fn new(sock: Sock) -> Channel {
        Channel {
            sock,
            interest: IoEvent::NONE,
            ready: IoEvent::NONE,
            index: ChannelIndex::New,
        }
    }

    pub fn sock(&self) -> Sock {
        self.sock
    }

    pub fn interest(&self) -> IoEvent {
        self.interest
    }

    /// Adds `event` to the interest set. Returns whether the set changed;
    /// the owner only pushes a poller update on `true`, so repeated enables
    /// cost nothing at the syscall level.
    pub fn enable(&mut self, event: IoEvent) -> bool {
        let before = self.interest;
        self.interest |= event;
        self.interest != before
    }

    /// Removes `event` from the interest set. Returns whether the set changed.
    pub fn disable(&mut self, event: IoEvent) -> bool {
        let before = self.interest;
        self.interest &= !event;
        self.interest != before
    }

    pub fn disable_all(&mut self) -> bool {
        let before = self.interest;
        self.interest = IoEvent::NONE;
        self.interest != before
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    /// Readiness recorded by the poller for the current dispatch tick.
    pub fn ready(&self) -> IoEvent {
        self.ready
    }

    pub fn set_ready(&mut self, ready: IoEvent) {
        self.ready = ready;
    }

    pub fn index(&self) -> ChannelIndex {
        self.index
    }

    pub fn set_index(&mut self, index: ChannelIndex) {
        self.index = index;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("sock", &self.sock)
            .field("interest", &self.interest)
            .field("ready", &self.ready)
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_reports_change_once() {
        let mut ch = Channel::new(3);
        assert!(ch.enable(IoEvent::READ));
        // second enable is a no-op; the owner must not issue a poller update
        assert!(!ch.enable(IoEvent::READ));
        assert!(ch.enable(IoEvent::WRITE));
        assert!(!ch.enable(IoEvent::READ | IoEvent::WRITE));
    }

    #[test]
    fn test_disable_reports_change_once() {
        let mut ch = Channel::new(3);
        ch.enable(IoEvent::READ | IoEvent::WRITE);
        assert!(ch.disable(IoEvent::WRITE));
        assert!(!ch.disable(IoEvent::WRITE));
        assert!(ch.is_reading());
        assert!(!ch.is_writing());
        assert!(ch.disable_all());
        assert!(!ch.disable_all());
    }

    #[test]
    fn test_starts_unregistered() {
        let ch = Channel::new(9);
        assert_eq!(ch.index(), ChannelIndex::New);
        assert!(ch.interest().is_empty());
        assert!(ch.ready().is_empty());
    }
}
