//! Portable `poll(2)` backend; on Windows the same structure runs over
//! `WSAPoll`, which is the closest native analogue to a poll set.

use std::collections::HashMap;
use std::io;

use crate::channel::{Channel, ChannelIndex};
use crate::error::{Error, Result};
use crate::event::IoEvent;
use crate::poller::{plan_update, Poller, UpdateOp};
use crate::sys::{self, Sock};

pub struct PollPoller {
    fds: Vec<sys::PollFd>,
    /// socket → slot in `fds`.
    slots: HashMap<Sock, usize>,
    last_error: Option<i32>,
}

impl Default for PollPoller {
    fn default() -> Self {
        PollPoller::new()
    }
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            fds: Vec::new(),
            slots: HashMap::new(),
            last_error: None,
        }
    }

    fn delete_slot(&mut self, sock: Sock) {
        if let Some(slot) = self.slots.remove(&sock) {
            self.fds.swap_remove(slot);
            if slot < self.fds.len() {
                let moved = sys::poll_fd_sock(&self.fds[slot]);
                self.slots.insert(moved, slot);
            }
        }
    }
}

fn interest_bits(interest: IoEvent) -> i16 {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= sys::POLL_READ;
    }
    if interest.is_writable() {
        bits |= sys::POLL_WRITE;
    }
    bits
}

fn ready_events(revents: i16) -> IoEvent {
    let mut ready = IoEvent::NONE;
    if revents & sys::POLL_ERR != 0 {
        ready |= IoEvent::ERROR;
    }
    if revents & sys::POLL_HUP != 0 && revents & sys::POLL_IN == 0 {
        ready |= IoEvent::CLOSE;
    }
    if revents & sys::POLL_READ != 0 {
        ready |= IoEvent::READ;
    }
    if revents & sys::POLL_WRITE != 0 {
        ready |= IoEvent::WRITE;
    }
    ready
}

impl Poller for PollPoller {
    fn update_channel(&mut self, channel: &mut Channel) -> Result<()> {
        let sock = channel.sock();
        match plan_update(channel) {
            UpdateOp::Skip => Ok(()),
            UpdateOp::Add => {
                self.slots.insert(sock, self.fds.len());
                self.fds.push(sys::poll_fd(sock, interest_bits(channel.interest())));
                channel.set_index(ChannelIndex::Added);
                Ok(())
            }
            UpdateOp::Modify => {
                // slot must exist for an Added channel; treat a missing one as
                // a registration fault rather than silently re-adding
                match self.slots.get(&sock) {
                    Some(&slot) => {
                        self.fds[slot].events = interest_bits(channel.interest());
                        Ok(())
                    }
                    None => {
                        let err = io::Error::from(io::ErrorKind::NotFound);
                        self.last_error = Some(libc_enoent());
                        Err(Error::Registration { sock, source: err })
                    }
                }
            }
            UpdateOp::Delete => {
                self.delete_slot(sock);
                channel.set_index(ChannelIndex::Deleted);
                Ok(())
            }
        }
    }

    fn remove_channel(&mut self, channel: &mut Channel) -> Result<()> {
        self.delete_slot(channel.sock());
        channel.set_index(ChannelIndex::New);
        Ok(())
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.slots.contains_key(&channel.sock())
    }

    fn poll(&mut self, timeout_ms: i32, ready: &mut Vec<(Sock, IoEvent)>) -> Result<usize> {
        if self.fds.is_empty() {
            // nothing registered; honor the timeout instead of spinning
            if timeout_ms != 0 {
                let ms = if timeout_ms < 0 { 10 } else { timeout_ms as u64 };
                std::thread::sleep(std::time::Duration::from_millis(ms));
            }
            return Ok(0);
        }
        for pfd in &mut self.fds {
            pfd.revents = 0;
        }
        let n = sys::poll(&mut self.fds, timeout_ms);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        let mut count = 0;
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            let revents = ready_events(pfd.revents);
            if !revents.is_empty() {
                ready.push((sys::poll_fd_sock(pfd), revents));
                count += 1;
            }
        }
        Ok(count)
    }

    fn last_error(&self) -> Option<i32> {
        self.last_error
    }
}

fn libc_enoent() -> i32 {
    #[cfg(unix)]
    {
        libc::ENOENT
    }
    #[cfg(windows)]
    {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wakeup::Wakeup;

    #[test]
    fn test_pipe_read_readiness() {
        let mut poller = PollPoller::new();
        let wakeup = Wakeup::new().unwrap();

        let mut ch = Channel::new(wakeup.sock());
        ch.enable(IoEvent::READ);
        poller.update_channel(&mut ch).unwrap();
        assert!(poller.has_channel(&ch));

        let mut ready = Vec::new();
        poller.poll(0, &mut ready).unwrap();
        assert!(ready.is_empty());

        wakeup.notify();
        poller.poll(1000, &mut ready).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, wakeup.sock());
        assert!(ready[0].1.is_readable());
    }

    #[test]
    fn test_slot_compaction_on_delete() {
        let mut poller = PollPoller::new();
        let a = Wakeup::new().unwrap();
        let b = Wakeup::new().unwrap();

        let mut ch_a = Channel::new(a.sock());
        ch_a.enable(IoEvent::READ);
        poller.update_channel(&mut ch_a).unwrap();

        let mut ch_b = Channel::new(b.sock());
        ch_b.enable(IoEvent::READ);
        poller.update_channel(&mut ch_b).unwrap();

        // removing the first slot swaps the second into its place; readiness
        // for b must still be reported afterwards
        poller.remove_channel(&mut ch_a).unwrap();
        assert!(!poller.has_channel(&ch_a));
        assert!(poller.has_channel(&ch_b));

        b.notify();
        let mut ready = Vec::new();
        poller.poll(1000, &mut ready).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, b.sock());
    }

    #[test]
    fn test_interest_modify_changes_mask() {
        let mut poller = PollPoller::new();
        let wakeup = Wakeup::new().unwrap();

        let mut ch = Channel::new(wakeup.sock());
        ch.enable(IoEvent::READ);
        poller.update_channel(&mut ch).unwrap();

        // drop read interest; a pending byte must no longer be reported
        ch.disable(IoEvent::READ);
        ch.enable(IoEvent::WRITE);
        poller.update_channel(&mut ch).unwrap();
        wakeup.notify();
        let mut ready = Vec::new();
        poller.poll(50, &mut ready).unwrap();
        // the read end of a pipe is never write-ready, and read interest is off
        assert!(ready.iter().all(|(_, ev)| !ev.is_readable()));
    }
}
