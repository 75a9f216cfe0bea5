//! Edge-triggered epoll backend.

use std::collections::HashMap;
use std::io;

use crate::channel::{Channel, ChannelIndex};
use crate::error::{Error, Result};
use crate::event::IoEvent;
use crate::poller::{plan_update, Poller, UpdateOp};
use crate::sys::{self, Sock};

const INITIAL_EVENT_CAPACITY: usize = 64;

pub struct EpollPoller {
    epfd: libc::c_int,
    /// Mirror of the OS registrations, keyed by socket. Kept in lockstep with
    /// the epoll set by `update_channel`/`remove_channel`.
    channels: HashMap<Sock, IoEvent>,
    events: Vec<libc::epoll_event>,
    last_error: Option<i32>,
}

impl EpollPoller {
    pub fn new() -> Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(EpollPoller {
            epfd,
            channels: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENT_CAPACITY],
            last_error: None,
        })
    }

    fn ctl(&mut self, op: libc::c_int, sock: Sock, interest: IoEvent) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(interest),
            u64: sock as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, sock, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            self.last_error = err.raw_os_error();
            return Err(Error::Registration { sock, source: err });
        }
        Ok(())
    }
}

/// Interest set to epoll registration bits. Registrations are edge-triggered;
/// consumers loop their reads and writes until `EWOULDBLOCK`.
fn interest_bits(interest: IoEvent) -> u32 {
    let mut bits = libc::EPOLLET as u32;
    if interest.is_readable() {
        bits |= (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn ready_events(bits: u32) -> IoEvent {
    let mut ready = IoEvent::NONE;
    if bits & libc::EPOLLERR as u32 != 0 {
        ready |= IoEvent::ERROR;
    }
    // A hangup with readable data still pending is delivered as READ so the
    // remaining bytes are drained; the read path sees EOF afterwards.
    if bits & libc::EPOLLHUP as u32 != 0 && bits & libc::EPOLLIN as u32 == 0 {
        ready |= IoEvent::CLOSE;
    }
    if bits & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
        ready |= IoEvent::READ;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        ready |= IoEvent::WRITE;
    }
    ready
}

impl Poller for EpollPoller {
    fn update_channel(&mut self, channel: &mut Channel) -> Result<()> {
        let sock = channel.sock();
        match plan_update(channel) {
            UpdateOp::Skip => Ok(()),
            UpdateOp::Add => {
                self.ctl(libc::EPOLL_CTL_ADD, sock, channel.interest())?;
                self.channels.insert(sock, channel.interest());
                channel.set_index(ChannelIndex::Added);
                Ok(())
            }
            UpdateOp::Modify => {
                self.ctl(libc::EPOLL_CTL_MOD, sock, channel.interest())?;
                self.channels.insert(sock, channel.interest());
                Ok(())
            }
            UpdateOp::Delete => {
                self.ctl(libc::EPOLL_CTL_DEL, sock, IoEvent::NONE)?;
                self.channels.remove(&sock);
                channel.set_index(ChannelIndex::Deleted);
                Ok(())
            }
        }
    }

    fn remove_channel(&mut self, channel: &mut Channel) -> Result<()> {
        let sock = channel.sock();
        let result = if channel.index() == ChannelIndex::Added {
            self.ctl(libc::EPOLL_CTL_DEL, sock, IoEvent::NONE)
        } else {
            Ok(())
        };
        self.channels.remove(&sock);
        channel.set_index(ChannelIndex::New);
        result
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.contains_key(&channel.sock())
    }

    fn poll(&mut self, timeout_ms: i32, ready: &mut Vec<(Sock, IoEvent)>) -> Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        let n = n as usize;
        for ev in &self.events[..n] {
            let revents = ready_events(ev.events);
            if !revents.is_empty() {
                ready.push((ev.u64 as Sock, revents));
            }
        }
        // A full batch suggests more sockets were ready than fit; grow so a
        // busy listener cannot starve the tail of the poll set.
        if n == self.events.len() {
            self.events
                .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
        }
        Ok(n)
    }

    fn last_error(&self) -> Option<i32> {
        self.last_error
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        sys::close(self.epfd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wakeup::Wakeup;

    #[test]
    fn test_pipe_read_readiness() {
        let mut poller = EpollPoller::new().unwrap();
        let wakeup = Wakeup::new().unwrap();

        let mut ch = Channel::new(wakeup.sock());
        ch.enable(IoEvent::READ);
        poller.update_channel(&mut ch).unwrap();
        assert!(poller.has_channel(&ch));
        assert_eq!(ch.index(), ChannelIndex::Added);

        let mut ready = Vec::new();
        poller.poll(0, &mut ready).unwrap();
        assert!(ready.is_empty());

        wakeup.notify();
        poller.poll(1000, &mut ready).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, wakeup.sock());
        assert!(ready[0].1.is_readable());

        poller.remove_channel(&mut ch).unwrap();
        assert!(!poller.has_channel(&ch));
        assert_eq!(ch.index(), ChannelIndex::New);
    }

    #[test]
    fn test_empty_interest_removes_registration() {
        let mut poller = EpollPoller::new().unwrap();
        let wakeup = Wakeup::new().unwrap();

        let mut ch = Channel::new(wakeup.sock());
        ch.enable(IoEvent::READ);
        poller.update_channel(&mut ch).unwrap();

        ch.disable_all();
        poller.update_channel(&mut ch).unwrap();
        assert_eq!(ch.index(), ChannelIndex::Deleted);
        assert!(!poller.has_channel(&ch));

        // pending byte must not surface once deregistered
        wakeup.notify();
        let mut ready = Vec::new();
        poller.poll(50, &mut ready).unwrap();
        assert!(ready.is_empty());

        // re-adding after deletion works
        ch.enable(IoEvent::READ);
        poller.update_channel(&mut ch).unwrap();
        assert_eq!(ch.index(), ChannelIndex::Added);
        poller.poll(1000, &mut ready).unwrap();
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_registration_failure_reports_errno() {
        let mut poller = EpollPoller::new().unwrap();
        let mut ch = Channel::new(-1);
        ch.enable(IoEvent::READ);
        let err = poller.update_channel(&mut ch);
        assert!(err.is_err());
        assert!(poller.last_error().is_some());
        assert_eq!(ch.index(), ChannelIndex::New);
        assert!(!poller.has_channel(&ch));
    }
}
