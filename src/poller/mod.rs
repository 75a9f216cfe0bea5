//! Readiness-multiplexing backends.
//!
//! A [`Poller`] owns the OS-side registration of a set of channels and blocks
//! collecting readiness for all of them at once. Two backends are provided:
//! an edge-triggered epoll backend on Linux and a portable `poll(2)`-based
//! emulation (`WSAPoll` on Windows). Loops take a boxed trait object, so a
//! custom backend can be injected through
//! [`PollerFactory`] for testing or for platforms not covered here.

use std::sync::Arc;

use crate::channel::{Channel, ChannelIndex};
use crate::error::Result;
use crate::event::IoEvent;
use crate::sys::Sock;

#[cfg(target_os = "linux")]
mod epoll;
mod poll;

#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;
pub use poll::PollPoller;

/// Abstract readiness multiplexer.
///
/// Registration state lives in two places that must never diverge: the OS
/// poll set and the backend's own socket map. Both are mutated only through
/// `update_channel`/`remove_channel`, which key off the channel's
/// [`ChannelIndex`]; see [`plan_update`].
pub trait Poller: Send {
    /// Synchronizes the OS registration with the channel's interest set,
    /// issuing an add, modify, or delete as the bookkeeping index dictates.
    fn update_channel(&mut self, channel: &mut Channel) -> Result<()>;

    /// Drops the channel from the poll set entirely and resets its index.
    fn remove_channel(&mut self, channel: &mut Channel) -> Result<()>;

    /// Whether this poller currently tracks the channel's socket.
    fn has_channel(&self, channel: &Channel) -> bool;

    /// Blocks up to `timeout_ms` (negative = indefinitely) and appends every
    /// socket with non-zero readiness to `ready`. Returns the event count.
    fn poll(&mut self, timeout_ms: i32, ready: &mut Vec<(Sock, IoEvent)>) -> Result<usize>;

    /// Errno of the most recent failed registration syscall, if any.
    fn last_error(&self) -> Option<i32> {
        None
    }
}

/// The OS operation a channel update must issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Add,
    Modify,
    Delete,
    /// Empty interest on an unregistered channel: nothing to do.
    Skip,
}

/// Single decision point shared by every backend: maps the channel's
/// bookkeeping index and interest set to the OS operation to perform.
pub fn plan_update(channel: &Channel) -> UpdateOp {
    match channel.index() {
        ChannelIndex::New | ChannelIndex::Deleted => {
            if channel.interest().is_empty() {
                UpdateOp::Skip
            } else {
                UpdateOp::Add
            }
        }
        ChannelIndex::Added => {
            if channel.interest().is_empty() {
                UpdateOp::Delete
            } else {
                UpdateOp::Modify
            }
        }
    }
}

/// Constructor for poller instances. Each event loop gets its own poller from
/// the factory; poll sets are not shareable across threads.
pub type PollerFactory = Arc<dyn Fn() -> Result<Box<dyn Poller>> + Send + Sync>;

/// Builds the platform-appropriate backend.
pub fn default_poller() -> Result<Box<dyn Poller>> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            Ok(Box::new(EpollPoller::new()?))
        } else {
            Ok(Box::new(PollPoller::new()))
        }
    }
}

pub fn default_factory() -> PollerFactory {
    Arc::new(default_poller)
}
