//! Per-socket connection state machine.
//!
//! A `Connection` coordinates transport I/O with the application's protocol
//! hooks. It owns its channel, its transport, and its two buffers; the owning
//! event loop owns the connection (shared with in-flight task closures, which
//! is the one place shared ownership is required). Every callback fires on the
//! owning loop's thread.
//!
//! ```text
//!  Connected ──shutdown()──▶ Closing ──outbound drained──▶ Closed
//!      │                        │                            ▲
//!      └── error / peer close / force_close ─────────────────┘
//! ```

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::error::Result;
use crate::event::IoEvent;
use crate::event_loop::EventLoop;
use crate::logger::{LogLevel, Logger};
use crate::net::transport::{IoResult, Transport};
use crate::sys::{self, Sock};

/// Protocol hooks implemented by the application layer.
///
/// Only `on_message` is required. Handlers are invoked from the connection's
/// owning loop thread; implementations must be `Send + Sync` because one
/// handler instance is typically shared across every connection of a server.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// The connection is registered and (if the transport needed one) its
    /// handshake has completed.
    fn on_connected(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// A transport handshake just finished.
    fn on_handshake_done(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// A timeout event was delivered by an external timer collaborator.
    fn on_timeout(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// Bytes arrived. Consume exactly what was fully parsed; unconsumed bytes
    /// stay buffered for the next delivery.
    fn on_message(&self, conn: &Arc<Connection>, input: &mut Buffer);

    /// The outbound buffer fully drained.
    fn on_write_complete(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// A graceful shutdown was requested; pending writes will still drain.
    fn on_closing(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// The connection reached its terminal state. Fires exactly once.
    fn on_closed(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// A transport error with the raw OS error code; the connection is closed
    /// right after this returns.
    fn on_error(&self, conn: &Arc<Connection>, code: i32) {
        let _ = (conn, code);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connected = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

struct Inner {
    channel: Channel,
    transport: Box<dyn Transport>,
    input: Buffer,
    output: Buffer,
}

pub struct Connection {
    sock: Sock,
    owner: Arc<EventLoop>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    state: AtomicU8,
    handler: Arc<dyn ConnectionHandler>,
    inner: Mutex<Inner>,
    close_notify: Mutex<Option<Box<dyn FnOnce(Sock) + Send>>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    logger: Arc<dyn Logger>,
}

impl Connection {
    pub fn new(
        owner: Arc<EventLoop>,
        transport: Box<dyn Transport>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<Connection> {
        let sock = transport.sock();
        let peer = transport.peer_addr();
        let local = transport.local_addr();
        let logger = owner.logger().clone();
        Arc::new(Connection {
            sock,
            owner,
            peer,
            local,
            state: AtomicU8::new(ConnectionState::Connected as u8),
            handler,
            inner: Mutex::new(Inner {
                channel: Channel::new(sock),
                transport,
                input: Buffer::new(),
                output: Buffer::new(),
            }),
            close_notify: Mutex::new(None),
            context: Mutex::new(None),
            logger,
        })
    }

    pub fn sock(&self) -> Sock {
        self.sock
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn owner(&self) -> &Arc<EventLoop> {
        &self.owner
    }

    /// Stores an application value on the connection.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Box::new(value));
    }

    pub fn take_context<T: Any + Send>(&self) -> Option<T> {
        let boxed = self.context.lock().unwrap().take()?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                *self.context.lock().unwrap() = Some(other);
                None
            }
        }
    }

    /// Callback fired once when the connection closes, after `on_closed`.
    /// The acceptor uses this for its bookkeeping.
    pub(crate) fn set_close_notify<F>(&self, f: F)
    where
        F: FnOnce(Sock) + Send + 'static,
    {
        *self.close_notify.lock().unwrap() = Some(Box::new(f));
    }

    /// Arms initial interest and announces the connection. Runs on the owning
    /// loop thread as part of attach; a registration error propagates so the
    /// caller can roll the attach back.
    pub(crate) fn establish(self: &Arc<Self>) -> Result<()> {
        let needs_handshake = {
            let mut guard = self.inner.lock().unwrap();
            let needs_handshake = guard.transport.need_handshake();
            guard.channel.enable(IoEvent::READ);
            if needs_handshake && guard.transport.handshake_want_write() {
                guard.channel.enable(IoEvent::WRITE);
            }
            self.owner.update_channel(&mut guard.channel)?;
            needs_handshake
        };
        if !needs_handshake {
            self.handler.on_connected(self);
        }
        Ok(())
    }

    /// Closes the socket without firing any callback. Rollback path for a
    /// connection whose registration failed.
    pub(crate) fn abort(&self) {
        if self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst)
            == ConnectionState::Closed as u8
        {
            return;
        }
        let mut guard = self.inner.lock().unwrap();
        guard.channel.disable_all();
        let _ = self.owner.remove_channel(&mut guard.channel);
        guard.transport.close();
        drop(guard);
        self.owner.detach_in_loop(self.sock);
    }

    /// Dispatches one tick of observed readiness in strict priority order:
    /// error, then peer close, then timeout (which may co-fire with I/O), then
    /// read, then write. An error or close must never be masked by a read flag
    /// in the same batch.
    pub fn handle_event(self: &Arc<Self>, ready: IoEvent) {
        self.inner.lock().unwrap().channel.set_ready(ready);
        if ready.is_error() {
            self.handle_error();
            return;
        }
        if ready.is_close() {
            self.handle_close();
            return;
        }
        if ready.is_timeout() {
            self.handler.on_timeout(self);
        }
        if ready.is_readable() {
            self.handle_read();
        }
        if self.state() == ConnectionState::Closed {
            return;
        }
        if ready.is_writable() {
            self.handle_write();
        }
    }

    /// Injects a TIMEOUT readiness event from an external timer collaborator,
    /// marshalled onto the owning loop.
    pub fn deliver_timeout(self: &Arc<Self>) {
        let me = self.clone();
        self.owner.run_in_loop(move || {
            if me.state() != ConnectionState::Closed {
                me.handle_event(IoEvent::TIMEOUT);
            }
        });
    }

    /// Queues `data` for delivery. Loop-thread callers get an immediate write
    /// attempt; the unwritten remainder is buffered and write interest armed.
    /// Off-thread callers are marshalled with a private copy of `data`.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            self.logger.log(
                LogLevel::Warn,
                &format!("discarding send on socket {}: connection is {:?}", self.sock, self.state()),
            );
            return;
        }
        if self.owner.is_loop_thread() {
            self.send_in_loop(data);
        } else {
            let me = self.clone();
            let owned = data.to_vec();
            self.owner.post_task(move || me.send_in_loop(&owned));
        }
    }

    /// Graceful shutdown: stop accepting sends, drain what is buffered, then
    /// half-close the write direction.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let me = self.clone();
        self.owner.run_in_loop(move || {
            me.handler.on_closing(&me);
            let mut guard = me.inner.lock().unwrap();
            if guard.output.readable_bytes() == 0 && !guard.channel.is_writing() {
                guard.transport.shutdown_write();
            }
        });
    }

    /// Immediate close, skipping the outbound drain. Safe to call from any
    /// thread and any number of times.
    pub fn force_close(self: &Arc<Self>) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        let me = self.clone();
        self.owner.run_in_loop(move || me.handle_close());
    }

    pub(crate) fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            self.logger.log(
                LogLevel::Warn,
                &format!("discarding send on socket {}: connection is {:?}", self.sock, self.state()),
            );
            return;
        }
        let outcome = {
            let mut guard = self.inner.lock().unwrap();
            if guard.channel.is_writing() || guard.output.readable_bytes() > 0 {
                // a drain is already pending; preserve ordering by appending
                guard.output.append(data);
                return;
            }
            guard.output.append(data);
            let Inner {
                transport, output, ..
            } = &mut *guard;
            let outcome = transport.write_some(output);
            if let IoResult::Ok(_) | IoResult::WouldBlock = outcome {
                if guard.output.readable_bytes() > 0 && guard.channel.enable(IoEvent::WRITE) {
                    self.push_interest(&mut guard);
                }
            }
            outcome
        };
        match outcome {
            IoResult::Ok(_) | IoResult::WouldBlock => {
                if self.inner.lock().unwrap().output.readable_bytes() == 0 {
                    self.handler.on_write_complete(self);
                }
            }
            IoResult::PeerClosed => self.handle_close(),
            IoResult::Err(code) => self.report_error(code),
        }
    }

    fn handle_read(self: &Arc<Self>) {
        loop {
            if self.state() == ConnectionState::Closed {
                return;
            }
            let outcome = {
                let mut guard = self.inner.lock().unwrap();
                if guard.transport.need_handshake() {
                    drop(guard);
                    if self.advance_handshake() {
                        continue;
                    }
                    return;
                }
                let Inner {
                    transport, input, ..
                } = &mut *guard;
                transport.read_some(input)
            };
            match outcome {
                IoResult::Ok(n) if n > 0 => self.deliver_input(),
                IoResult::Ok(_) => return,
                IoResult::WouldBlock => return,
                IoResult::PeerClosed => {
                    self.handle_close();
                    return;
                }
                IoResult::Err(code) => {
                    self.report_error(code);
                    return;
                }
            }
        }
    }

    /// Hands the inbound buffer to `on_message` without holding the inner
    /// lock, so the handler is free to call `send`/`shutdown` reentrantly.
    fn deliver_input(self: &Arc<Self>) {
        let mut chunk = {
            let mut guard = self.inner.lock().unwrap();
            std::mem::take(&mut guard.input)
        };
        if chunk.readable_bytes() > 0 {
            self.handler.on_message(self, &mut chunk);
        }
        let mut guard = self.inner.lock().unwrap();
        if guard.input.readable_bytes() > 0 {
            chunk.append(guard.input.peek());
        }
        guard.input = chunk;
    }

    fn handle_write(self: &Arc<Self>) {
        let outcome = {
            let mut guard = self.inner.lock().unwrap();
            if !guard.channel.is_writing() {
                return;
            }
            if guard.output.readable_bytes() == 0 {
                IoResult::Ok(0)
            } else {
                let Inner {
                    transport, output, ..
                } = &mut *guard;
                transport.write_some(output)
            }
        };
        match outcome {
            IoResult::Ok(_) => {
                let drained = {
                    let mut guard = self.inner.lock().unwrap();
                    if guard.output.readable_bytes() == 0 {
                        if guard.channel.disable(IoEvent::WRITE) {
                            self.push_interest(&mut guard);
                        }
                        if self.state() == ConnectionState::Closing {
                            guard.transport.shutdown_write();
                        }
                        true
                    } else {
                        false
                    }
                };
                if drained {
                    self.handler.on_write_complete(self);
                }
            }
            IoResult::WouldBlock => {}
            IoResult::PeerClosed => self.handle_close(),
            IoResult::Err(code) => self.report_error(code),
        }
    }

    /// Drives a transport handshake one step. Returns whether `handle_read`
    /// should keep looping.
    fn advance_handshake(self: &Arc<Self>) -> bool {
        let outcome = {
            let mut guard = self.inner.lock().unwrap();
            guard.transport.handshake()
        };
        match outcome {
            IoResult::Ok(_) => {
                let done = {
                    let mut guard = self.inner.lock().unwrap();
                    if guard.transport.need_handshake() {
                        self.arm_handshake_interest(&mut guard);
                        false
                    } else {
                        // handshake finished: restore plain read interest
                        let mut changed = guard.channel.enable(IoEvent::READ);
                        changed |= guard.channel.disable(IoEvent::WRITE);
                        if changed {
                            self.push_interest(&mut guard);
                        }
                        true
                    }
                };
                if done {
                    self.handler.on_handshake_done(self);
                    self.handler.on_connected(self);
                }
                done
            }
            IoResult::WouldBlock => {
                let mut guard = self.inner.lock().unwrap();
                self.arm_handshake_interest(&mut guard);
                false
            }
            IoResult::PeerClosed => {
                self.handle_close();
                false
            }
            IoResult::Err(code) => {
                self.report_error(code);
                false
            }
        }
    }

    fn arm_handshake_interest(&self, guard: &mut std::sync::MutexGuard<'_, Inner>) {
        let mut changed = guard.channel.enable(IoEvent::READ);
        changed |= if guard.transport.handshake_want_write() {
            guard.channel.enable(IoEvent::WRITE)
        } else {
            guard.channel.disable(IoEvent::WRITE)
        };
        if changed {
            self.push_interest(guard);
        }
    }

    fn push_interest(&self, guard: &mut std::sync::MutexGuard<'_, Inner>) {
        let Inner { channel, .. } = &mut **guard;
        if let Err(e) = self.owner.update_channel(channel) {
            self.logger.log(
                LogLevel::Error,
                &format!("interest update failed on socket {}: {e}", self.sock),
            );
        }
    }

    fn handle_error(self: &Arc<Self>) {
        let code = sys::socket_error(self.sock);
        self.report_error(code);
    }

    fn report_error(self: &Arc<Self>, code: i32) {
        self.handler.on_error(self, code);
        self.handle_close();
    }

    /// Terminal transition. The swap guard collapses every close path
    /// (peer close, error, force close, drain-complete) into a single
    /// `on_closed` and a single transport close.
    fn handle_close(self: &Arc<Self>) {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        if previous == ConnectionState::Closed as u8 {
            return;
        }
        {
            let mut guard = self.inner.lock().unwrap();
            guard.channel.disable_all();
            if let Err(e) = self.owner.remove_channel(&mut guard.channel) {
                self.logger.log(
                    LogLevel::Debug,
                    &format!("poller removal failed on socket {}: {e}", self.sock),
                );
            }
        }
        self.owner.detach_in_loop(self.sock);
        self.handler.on_closed(self);
        self.inner.lock().unwrap().transport.close();
        if let Some(notify) = self.close_notify.lock().unwrap().take() {
            notify(self.sock);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("sock", &self.sock)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoOpLogger;
    use crate::poller::default_poller;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct FakeTransport {
        sock: Sock,
        closes: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        to_read: Mutex<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
        handshake_steps: AtomicUsize,
    }

    impl FakeTransport {
        fn new(sock: Sock) -> FakeTransport {
            FakeTransport {
                sock,
                closes: Arc::new(AtomicUsize::new(0)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                to_read: Mutex::new(Vec::new()),
                written: Arc::new(Mutex::new(Vec::new())),
                handshake_steps: AtomicUsize::new(0),
            }
        }
    }

    impl Transport for FakeTransport {
        fn read_some(&mut self, buf: &mut Buffer) -> IoResult {
            let mut pending = self.to_read.lock().unwrap();
            if pending.is_empty() {
                return IoResult::WouldBlock;
            }
            buf.append(&pending);
            let n = pending.len();
            pending.clear();
            IoResult::Ok(n)
        }

        fn write_some(&mut self, buf: &mut Buffer) -> IoResult {
            let n = buf.readable_bytes();
            self.written.lock().unwrap().extend_from_slice(buf.peek());
            buf.consume(n);
            IoResult::Ok(n)
        }

        fn shutdown_write(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn sock(&self) -> Sock {
            self.sock
        }

        fn need_handshake(&self) -> bool {
            self.handshake_steps.load(Ordering::SeqCst) < 2
        }

        fn handshake(&mut self) -> IoResult {
            self.handshake_steps.fetch_add(1, Ordering::SeqCst);
            IoResult::Ok(0)
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        connected: AtomicUsize,
        handshakes: AtomicUsize,
        closed: AtomicUsize,
        write_completes: AtomicUsize,
        timeouts: AtomicUsize,
        messages: Mutex<Vec<Vec<u8>>>,
    }

    impl ConnectionHandler for CountingHandler {
        fn on_connected(&self, _conn: &Arc<Connection>) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_handshake_done(&self, _conn: &Arc<Connection>) {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_timeout(&self, _conn: &Arc<Connection>) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, _conn: &Arc<Connection>, input: &mut Buffer) {
            self.messages.lock().unwrap().push(input.read_all());
        }

        fn on_write_complete(&self, _conn: &Arc<Connection>) {
            self.write_completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_closed(&self, _conn: &Arc<Connection>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spawn_loop() -> (Arc<EventLoop>, thread::JoinHandle<()>) {
        let event_loop = Arc::new(EventLoop::new(
            default_poller().unwrap(),
            Arc::new(NoOpLogger),
        ));
        let run_handle = event_loop.clone();
        let handle = thread::spawn(move || {
            run_handle.run().unwrap();
        });
        (event_loop, handle)
    }

    fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..deadline_ms / 5 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Fake-transport connections use an unregistered pipe fd so channel
    /// registration succeeds without a real socket.
    fn fake_conn(
        event_loop: &Arc<EventLoop>,
    ) -> (
        Arc<Connection>,
        Arc<CountingHandler>,
        Arc<AtomicUsize>,
        crate::wakeup::Wakeup,
    ) {
        let pipe = crate::wakeup::Wakeup::new().unwrap();
        let transport = FakeTransport::new(pipe.sock());
        // already past the handshake for the plain tests
        transport.handshake_steps.store(2, Ordering::SeqCst);
        let closes = transport.closes.clone();
        let handler = Arc::new(CountingHandler::default());
        let conn = Connection::new(event_loop.clone(), Box::new(transport), handler.clone());
        event_loop.attach_connection(conn.clone());
        (conn, handler, closes, pipe)
    }

    #[test]
    fn test_context_slot_round_trips_by_type() {
        let event_loop = Arc::new(EventLoop::new(
            Box::new(crate::poller::PollPoller::new()),
            Arc::new(NoOpLogger),
        ));
        let pipe = crate::wakeup::Wakeup::new().unwrap();
        let transport = FakeTransport::new(pipe.sock());
        transport.handshake_steps.store(2, Ordering::SeqCst);
        let conn = Connection::new(
            event_loop,
            Box::new(transport),
            Arc::new(CountingHandler::default()),
        );

        conn.set_context(41u32);
        // a mismatched type leaves the stored value in place
        assert_eq!(conn.take_context::<String>(), None);
        assert_eq!(conn.take_context::<u32>(), Some(41));
        assert_eq!(conn.take_context::<u32>(), None);
    }

    #[test]
    fn test_force_close_fires_callbacks_exactly_once() {
        let (event_loop, handle) = spawn_loop();
        let (conn, handler, closes, _pipe) = fake_conn(&event_loop);

        assert!(wait_until(2000, || handler.connected.load(Ordering::SeqCst) == 1));
        for _ in 0..5 {
            conn.force_close();
        }
        assert!(wait_until(2000, || handler.closed.load(Ordering::SeqCst) >= 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(event_loop.connection_count(), 0);

        event_loop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_read_event_delivers_message() {
        let (event_loop, handle) = spawn_loop();
        let pipe = crate::wakeup::Wakeup::new().unwrap();
        let transport = FakeTransport::new(pipe.sock());
        transport.handshake_steps.store(2, Ordering::SeqCst);
        *transport.to_read.lock().unwrap() = b"PING".to_vec();
        let handler = Arc::new(CountingHandler::default());
        let conn = Connection::new(event_loop.clone(), Box::new(transport), handler.clone());
        event_loop.attach_connection(conn.clone());
        assert!(wait_until(2000, || handler.connected.load(Ordering::SeqCst) == 1));

        let target = conn.clone();
        event_loop.post_task(move || target.handle_event(IoEvent::READ));
        assert!(wait_until(2000, || handler.messages.lock().unwrap().len() == 1));
        assert_eq!(handler.messages.lock().unwrap()[0], b"PING");

        event_loop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_send_from_foreign_thread_preserves_order() {
        let (event_loop, handle) = spawn_loop();
        let pipe = crate::wakeup::Wakeup::new().unwrap();
        let transport = FakeTransport::new(pipe.sock());
        transport.handshake_steps.store(2, Ordering::SeqCst);
        let written = transport.written.clone();
        let handler = Arc::new(CountingHandler::default());
        let conn = Connection::new(event_loop.clone(), Box::new(transport), handler.clone());
        event_loop.attach_connection(conn.clone());
        assert!(wait_until(2000, || handler.connected.load(Ordering::SeqCst) == 1));

        conn.send(b"A");
        conn.send(b"B");
        assert!(wait_until(2000, || written.lock().unwrap().len() == 2));
        assert_eq!(&*written.lock().unwrap(), b"AB");

        event_loop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_sends_refused_after_shutdown() {
        let (event_loop, handle) = spawn_loop();
        let pipe = crate::wakeup::Wakeup::new().unwrap();
        let transport = FakeTransport::new(pipe.sock());
        transport.handshake_steps.store(2, Ordering::SeqCst);
        let written = transport.written.clone();
        let shutdowns = transport.shutdowns.clone();
        let handler = Arc::new(CountingHandler::default());
        let conn = Connection::new(event_loop.clone(), Box::new(transport), handler.clone());
        event_loop.attach_connection(conn.clone());
        assert!(wait_until(2000, || handler.connected.load(Ordering::SeqCst) == 1));

        conn.shutdown();
        assert!(wait_until(2000, || shutdowns.load(Ordering::SeqCst) == 1));
        assert_eq!(conn.state(), ConnectionState::Closing);
        conn.send(b"late");
        thread::sleep(Duration::from_millis(50));
        assert!(written.lock().unwrap().is_empty());

        event_loop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_handshake_completion_fires_connected() {
        let (event_loop, handle) = spawn_loop();
        let pipe = crate::wakeup::Wakeup::new().unwrap();
        let transport = FakeTransport::new(pipe.sock());
        let handler = Arc::new(CountingHandler::default());
        let conn = Connection::new(event_loop.clone(), Box::new(transport), handler.clone());
        event_loop.attach_connection(conn.clone());

        // connected-callback must wait for the handshake
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handler.connected.load(Ordering::SeqCst), 0);

        // two read events drive the two handshake steps
        for _ in 0..2 {
            let target = conn.clone();
            event_loop.post_task(move || target.handle_event(IoEvent::READ));
        }
        assert!(wait_until(2000, || handler.connected.load(Ordering::SeqCst) == 1));
        assert_eq!(handler.handshakes.load(Ordering::SeqCst), 1);

        event_loop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_timeout_delivery() {
        let (event_loop, handle) = spawn_loop();
        let (conn, handler, _closes, _pipe) = fake_conn(&event_loop);
        assert!(wait_until(2000, || handler.connected.load(Ordering::SeqCst) == 1));

        conn.deliver_timeout();
        assert!(wait_until(2000, || handler.timeouts.load(Ordering::SeqCst) == 1));
        assert_eq!(conn.state(), ConnectionState::Connected);

        event_loop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_error_event_reports_then_closes() {
        let (event_loop, handle) = spawn_loop();
        let (conn, handler, closes, _pipe) = fake_conn(&event_loop);
        assert!(wait_until(2000, || handler.connected.load(Ordering::SeqCst) == 1));

        let target = conn.clone();
        event_loop.post_task(move || target.handle_event(IoEvent::ERROR | IoEvent::READ));
        assert!(wait_until(2000, || handler.closed.load(Ordering::SeqCst) == 1));
        // the co-fired READ flag must not have been dispatched after the error
        assert!(handler.messages.lock().unwrap().is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        event_loop.stop();
        handle.join().unwrap();
    }
}
