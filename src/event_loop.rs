//! Single-threaded reactor loop.
//!
//! One `EventLoop` owns one poller and runs on exactly one OS thread (the
//! thread that calls [`run`](EventLoop::run); first call wins). Everything a
//! connection does happens on that thread; other threads talk to the loop only
//! through [`post_task`](EventLoop::post_task), which enqueues a closure and
//! interrupts the blocking poll through the loop's wakeup pipe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::event::IoEvent;
use crate::logger::{LogLevel, Logger};
use crate::net::connection::Connection;
use crate::poller::Poller;
use crate::sys::Sock;
use crate::wakeup::Wakeup;

/// Poll timeout used when the loop has no wakeup pipe and must observe posted
/// tasks and stop requests by waking up periodically.
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 10_000;

/// Tasks executed per tick before the loop yields back to I/O dispatch; the
/// remainder is requeued and the loop wakes itself.
pub const TASKS_PER_TICK: usize = 1024;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct EventLoop {
    poller: Mutex<Box<dyn Poller>>,
    connections: Mutex<HashMap<Sock, Arc<Connection>>>,
    pending: Mutex<Vec<Task>>,
    wakeup: Option<Wakeup>,
    running: AtomicBool,
    quit: AtomicBool,
    draining: AtomicBool,
    tid: OnceLock<ThreadId>,
    logger: Arc<dyn Logger>,
}

impl EventLoop {
    pub fn new(poller: Box<dyn Poller>, logger: Arc<dyn Logger>) -> EventLoop {
        let wakeup = match Wakeup::new() {
            Ok(w) => Some(w),
            Err(e) => {
                logger.log(
                    LogLevel::Warn,
                    &format!("wakeup pipe unavailable, falling back to bounded poll: {e}"),
                );
                None
            }
        };
        EventLoop {
            poller: Mutex::new(poller),
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            wakeup,
            running: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            tid: OnceLock::new(),
            logger,
        }
    }

    /// Whether the calling thread is the one this loop is pinned to.
    pub fn is_loop_thread(&self) -> bool {
        self.tid.get() == Some(&thread::current().id())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs the reactor cycle until [`stop`](EventLoop::stop): poll, dispatch
    /// every ready channel, then drain posted tasks. Blocks the caller.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        self.run_hooked(None)
    }

    /// Like [`run`](EventLoop::run), with a dispatch override consulted for
    /// sockets the loop does not know as connections (the accept loop routes
    /// its listening sockets through this).
    pub(crate) fn run_hooked(
        self: &Arc<Self>,
        hook: Option<&dyn Fn(Sock, IoEvent)>,
    ) -> Result<()> {
        let current = thread::current().id();
        let pinned = *self.tid.get_or_init(|| current);
        if pinned != current {
            return Err(Error::LoopBusy);
        }
        self.running.store(true, Ordering::SeqCst);

        // the wakeup pipe is a plain read channel on this loop's own poller
        let mut wakeup_channel = self.wakeup.as_ref().map(|w| Channel::new(w.sock()));
        if let Some(ch) = wakeup_channel.as_mut() {
            ch.enable(IoEvent::READ);
            if let Err(e) = self.update_channel(ch) {
                self.logger.log(
                    LogLevel::Warn,
                    &format!("failed to register wakeup channel: {e}"),
                );
            }
        }
        let wakeup_sock = wakeup_channel.as_ref().map(|ch| ch.sock());

        let timeout = if self.wakeup.is_some() {
            -1
        } else {
            DEFAULT_POLL_TIMEOUT_MS
        };

        let mut ready: Vec<(Sock, IoEvent)> = Vec::new();
        while !self.quit.load(Ordering::SeqCst) {
            ready.clear();
            let polled = {
                let mut poller = self.poller.lock().unwrap();
                poller.poll(timeout, &mut ready)
            };
            if let Err(e) = polled {
                self.logger.log(LogLevel::Error, &format!("poll failed: {e}"));
                thread::sleep(std::time::Duration::from_millis(100));
                continue;
            }

            for (sock, events) in ready.drain(..) {
                if Some(sock) == wakeup_sock {
                    if let Some(w) = &self.wakeup {
                        w.drain();
                    }
                    continue;
                }
                let conn = self.connections.lock().unwrap().get(&sock).cloned();
                match conn {
                    Some(conn) => conn.handle_event(events),
                    None => match hook {
                        Some(hook) => hook(sock, events),
                        None => self.logger.log(
                            LogLevel::Debug,
                            &format!("readiness for unknown socket {sock}: {events:?}"),
                        ),
                    },
                }
            }

            self.drain_tasks();
        }

        // close whatever is still attached; connections hold an owner handle
        // back to this loop, so leaving them in the map would keep both alive
        let leftover: Vec<_> = self.connections.lock().unwrap().values().cloned().collect();
        for conn in leftover {
            conn.force_close();
        }
        self.pending.lock().unwrap().clear();

        if let Some(ch) = wakeup_channel.as_mut() {
            let mut poller = self.poller.lock().unwrap();
            let _ = poller.remove_channel(ch);
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn drain_tasks(&self) {
        let mut tasks = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };
        self.draining.store(true, Ordering::SeqCst);

        let run_now = tasks.len().min(TASKS_PER_TICK);
        for task in tasks.drain(..run_now) {
            task();
        }
        if !tasks.is_empty() {
            // over-budget remainder goes back at the tail so I/O dispatch gets
            // a turn; wake immediately so the tasks are not stuck behind an
            // indefinite poll
            self.pending.lock().unwrap().extend(tasks);
            self.wake();
        }
        self.draining.store(false, Ordering::SeqCst);
    }

    /// Enqueues a closure for execution on the loop thread. Always succeeds;
    /// the queue is unbounded because tasks are cheap marshalled closures, not
    /// backpressure-sensitive work.
    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().unwrap().push(Box::new(task));
        // off-thread posts always wake; on-thread posts wake only mid-drain,
        // where the tick's "queue empty" check has already passed
        if !self.is_loop_thread() || self.draining.load(Ordering::SeqCst) {
            self.wake();
        }
    }

    /// Runs `f` inline when called from the loop thread, otherwise posts it.
    pub fn run_in_loop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_loop_thread() {
            f();
        } else {
            self.post_task(f);
        }
    }

    /// Signals the loop to exit after the current tick. Idempotent; always
    /// wakes so a blocking poll cannot mask the request.
    pub fn stop(&self) {
        let _ = self
            .quit
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);
        self.wake();
    }

    fn wake(&self) {
        if let Some(w) = &self.wakeup {
            w.notify();
        }
    }

    /// Inserts the connection into this loop's registry and registers its
    /// channel, marshalling onto the loop thread if needed. Registration
    /// failure is rolled back and logged; the loop keeps serving.
    pub fn attach_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        let me = self.clone();
        self.run_in_loop(move || {
            if let Err(e) = me.attach_in_loop(conn.clone()) {
                me.logger.log(
                    LogLevel::Error,
                    &format!(
                        "failed to register connection on socket {}: {e}; closing it",
                        conn.sock()
                    ),
                );
                conn.abort();
            }
        });
    }

    /// Removes the connection for `sock` from this loop's registry,
    /// marshalling onto the loop thread if needed.
    pub fn detach_connection(self: &Arc<Self>, sock: Sock) {
        let me = self.clone();
        self.run_in_loop(move || me.detach_in_loop(sock));
    }

    pub(crate) fn attach_in_loop(
        self: &Arc<Self>,
        conn: Arc<Connection>,
    ) -> Result<()> {
        self.connections
            .lock()
            .unwrap()
            .insert(conn.sock(), conn.clone());
        if let Err(e) = conn.establish() {
            self.connections.lock().unwrap().remove(&conn.sock());
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn detach_in_loop(&self, sock: Sock) {
        self.connections.lock().unwrap().remove(&sock);
    }

    /// Pushes a channel's interest set to the poller. Loop-thread only.
    pub(crate) fn update_channel(&self, channel: &mut Channel) -> Result<()> {
        self.poller.lock().unwrap().update_channel(channel)
    }

    pub(crate) fn remove_channel(&self, channel: &mut Channel) -> Result<()> {
        self.poller.lock().unwrap().remove_channel(channel)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn queued_tasks(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub(crate) fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    /// Sends `data` to every connection on this loop except `excluded`.
    /// Loop-thread only; cross-thread callers post this through `post_task`.
    pub fn broadcast_local_except(self: &Arc<Self>, data: &[u8], excluded: Option<Sock>) {
        let targets: Vec<_> = self
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for conn in targets {
            if excluded == Some(conn.sock()) {
                continue;
            }
            conn.send(data);
        }
    }
}
