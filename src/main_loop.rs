//! Accepting front door: one accept loop fanning sockets out to a pool of
//! worker loops.
//!
//! The `MainEventLoop` owns a base [`EventLoop`] whose ready channels are all
//! listening sockets, plus N sub-loops pre-created at construction, each with
//! its own poller and OS thread. Accepted sockets are round-robined to a
//! sub-loop; the connection object is then constructed and registered on that
//! sub-loop's own thread, so a connection never migrates and never needs a
//! lock for dispatch.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::channel::Channel;
use crate::error::Result;
use crate::event::IoEvent;
use crate::event_loop::EventLoop;
use crate::logger::{LogLevel, Logger};
use crate::net::connection::Connection;
use crate::poller::PollerFactory;
use crate::sys::{self, Sock};
use crate::utils;

/// Builds the connection object for an accepted socket, on the owning
/// sub-loop's thread.
pub type ConnectionFactory =
    Arc<dyn Fn(TcpStream, Arc<EventLoop>) -> Result<Arc<Connection>> + Send + Sync>;

/// Socket options applied to every accepted connection.
#[derive(Clone, Copy)]
pub struct AcceptOptions {
    pub no_delay: bool,
    pub keep_alive: bool,
}

impl Default for AcceptOptions {
    fn default() -> Self {
        AcceptOptions {
            no_delay: true,
            keep_alive: false,
        }
    }
}

struct Listener {
    socket: TcpListener,
    channel: Channel,
}

pub struct MainEventLoop {
    base: Arc<EventLoop>,
    subs: Vec<Arc<EventLoop>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_sub: AtomicUsize,
    listeners: Mutex<HashMap<Sock, Listener>>,
    factory: ConnectionFactory,
    options: AcceptOptions,
    active: Arc<AtomicUsize>,
    logger: Arc<dyn Logger>,
}

impl MainEventLoop {
    /// Creates the accept loop and `sub_loops` worker loops (0 = hardware
    /// concurrency), spawning one named OS thread per worker immediately.
    pub fn new(
        sub_loops: usize,
        poller_factory: PollerFactory,
        factory: ConnectionFactory,
        options: AcceptOptions,
        logger: Arc<dyn Logger>,
    ) -> Result<Arc<MainEventLoop>> {
        let count = if sub_loops == 0 {
            utils::default_loop_count()
        } else {
            sub_loops
        };

        let base = Arc::new(EventLoop::new(poller_factory()?, logger.clone()));
        let mut subs = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for id in 0..count {
            let sub = Arc::new(EventLoop::new(poller_factory()?, logger.clone()));
            let runner = sub.clone();
            let handle = thread::Builder::new()
                .name(format!("sluice-sub-{id}"))
                .spawn(move || {
                    let _ = runner.run();
                })
                .map_err(crate::error::Error::Io)?;
            subs.push(sub);
            threads.push(handle);
        }

        Ok(Arc::new(MainEventLoop {
            base,
            subs,
            threads: Mutex::new(threads),
            next_sub: AtomicUsize::new(0),
            listeners: Mutex::new(HashMap::new()),
            factory,
            options,
            active: Arc::new(AtomicUsize::new(0)),
            logger,
        }))
    }

    /// Registers a listening socket with the accept loop. May be called
    /// before or after [`run`](MainEventLoop::run); registration is
    /// marshalled onto the accept loop's thread either way.
    pub fn add_listener(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let sock = sys::raw_socket(&listener);
        let me = self.clone();
        self.base.run_in_loop(move || {
            let mut channel = Channel::new(sock);
            channel.enable(IoEvent::READ);
            if let Err(e) = me.base.update_channel(&mut channel) {
                me.logger.log(
                    LogLevel::Error,
                    &format!("failed to register listener on socket {sock}: {e}"),
                );
                return;
            }
            me.listeners
                .lock()
                .unwrap()
                .insert(sock, Listener { socket: listener, channel });
        });
        Ok(())
    }

    /// Runs the accept loop on the calling thread until
    /// [`stop`](MainEventLoop::stop).
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let me = self.clone();
        let hook = move |sock: Sock, events: IoEvent| me.handle_listener_ready(sock, events);
        self.base.run_hooked(Some(&hook))
    }

    /// Stops every worker loop, joins their threads, then stops the accept
    /// loop itself.
    pub fn stop(&self) {
        for sub in &self.subs {
            sub.stop();
        }
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.base.stop();
    }

    pub fn sub_loops(&self) -> &[Arc<EventLoop>] {
        &self.subs
    }

    /// Connections currently attached across all sub-loops.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Sends `data` to every connection on every sub-loop, skipping
    /// `excluded` (usually the originating socket).
    pub fn broadcast(&self, data: &[u8], excluded: Option<Sock>) {
        let payload: Arc<[u8]> = Arc::from(data);
        for sub in &self.subs {
            let target = sub.clone();
            let payload = payload.clone();
            sub.post_task(move || target.broadcast_local_except(&payload, excluded));
        }
    }

    fn next_index(&self) -> usize {
        self.next_sub.fetch_add(1, Ordering::Relaxed) % self.subs.len()
    }

    /// Accept dispatch: drains the listening socket until it would block.
    /// A failed accept is logged and never brings the loop down.
    fn handle_listener_ready(&self, sock: Sock, events: IoEvent) {
        if !events.is_readable() {
            return;
        }
        loop {
            let accepted = {
                let listeners = self.listeners.lock().unwrap();
                match listeners.get(&sock) {
                    Some(listener) => listener.socket.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, peer)) => self.dispatch_accepted(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.logger
                        .log(LogLevel::Error, &format!("accept failed: {e}"));
                    break;
                }
            }
        }
    }

    /// Hands an accepted socket to a round-robined sub-loop. Construction,
    /// registration, and the connected-callback all happen on that sub-loop's
    /// thread; a registration failure rolls the connection back and closes
    /// the socket so nothing leaks.
    fn dispatch_accepted(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            self.logger.log(
                LogLevel::Error,
                &format!("failed to make accepted socket from {peer} non-blocking: {e}"),
            );
            return;
        }
        if self.options.no_delay {
            let _ = stream.set_nodelay(true);
        }
        if self.options.keep_alive {
            if let Err(e) = sys::set_keepalive(sys::raw_socket(&stream), true) {
                self.logger.log(
                    LogLevel::Warn,
                    &format!("failed to enable keep-alive for {peer}: {e}"),
                );
            }
        }

        let sub = self.subs[self.next_index()].clone();
        let factory = self.factory.clone();
        let logger = self.logger.clone();
        let active = self.active.clone();
        let target = sub.clone();
        sub.post_task(move || {
            let conn = match factory(stream, target.clone()) {
                Ok(conn) => conn,
                Err(e) => {
                    logger.log(
                        LogLevel::Error,
                        &format!("connection setup failed for {peer}: {e}"),
                    );
                    return;
                }
            };
            let counter = active.clone();
            conn.set_close_notify(move |_| {
                counter.fetch_sub(1, Ordering::SeqCst);
            });
            match target.attach_in_loop(conn.clone()) {
                Ok(()) => {
                    active.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    logger.log(
                        LogLevel::Error,
                        &format!("channel registration failed for {peer}: {e}; closing socket"),
                    );
                    conn.abort();
                }
            }
        });
    }
}

impl Drop for MainEventLoop {
    fn drop(&mut self) {
        let mut listeners = self.listeners.lock().unwrap();
        for (_, mut listener) in listeners.drain() {
            listener.channel.disable_all();
            let _ = self.base.remove_channel(&mut listener.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoOpLogger;
    use crate::net::transport::TcpTransport;
    use crate::poller::default_factory;
    use crate::net::connection::ConnectionHandler;
    use crate::buffer::Buffer;

    struct DropHandler;

    impl ConnectionHandler for DropHandler {
        fn on_message(&self, _conn: &Arc<Connection>, input: &mut Buffer) {
            input.consume_all();
        }
    }

    fn test_factory() -> ConnectionFactory {
        Arc::new(|stream, owner: Arc<EventLoop>| {
            let transport = TcpTransport::new(stream)?;
            Ok(Connection::new(owner, Box::new(transport), Arc::new(DropHandler)))
        })
    }

    #[test]
    fn test_round_robin_is_fair_and_ordered() {
        let main = MainEventLoop::new(
            3,
            default_factory(),
            test_factory(),
            AcceptOptions::default(),
            Arc::new(NoOpLogger),
        )
        .unwrap();

        let picks: Vec<usize> = (0..8).map(|_| main.next_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0, 1]);
        let mut counts = [0usize; 3];
        for pick in picks {
            counts[pick] += 1;
        }
        // 8 accepts over 3 loops: each loop gets floor(8/3) or ceil(8/3)
        assert_eq!(counts, [3, 3, 2]);

        main.stop();
    }

    #[test]
    fn test_sub_loop_count_defaults_to_hardware_concurrency() {
        let main = MainEventLoop::new(
            0,
            default_factory(),
            test_factory(),
            AcceptOptions::default(),
            Arc::new(NoOpLogger),
        )
        .unwrap();
        assert_eq!(main.sub_loops().len(), utils::default_loop_count());
        main.stop();
    }
}
