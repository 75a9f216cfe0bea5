//! Server lifecycle wrapper and cross-loop broadcast.
//!
//! `TcpServer` binds the listening sockets, owns the [`MainEventLoop`], and
//! drives the status machine `Stopped → Starting → Running → Stopping →
//! Stopped` from one dedicated thread. [`Broadcast`] fans a payload out to
//! every sub-loop's local connection map.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::logger::{LogLevel, Logger};
use crate::main_loop::{AcceptOptions, ConnectionFactory, MainEventLoop};
use crate::net::config::ServerConfig;
use crate::net::connection::{Connection, ConnectionHandler};
use crate::net::transport::TcpTransport;
use crate::poller;
use crate::sys::Sock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

pub struct TcpServer {
    config: ServerConfig,
    factory: ConnectionFactory,
    status: Mutex<ServerStatus>,
    status_changed: Condvar,
    main_loop: Mutex<Option<Arc<MainEventLoop>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    bound: Mutex<Vec<SocketAddr>>,
    logger: Arc<dyn Logger>,
}

impl TcpServer {
    /// Creates a server with an explicit connection factory. The factory runs
    /// on the accepting sub-loop's thread for every new socket.
    pub fn new(config: ServerConfig, factory: ConnectionFactory) -> TcpServer {
        let logger = config.logger.clone();
        TcpServer {
            config,
            factory,
            status: Mutex::new(ServerStatus::Stopped),
            status_changed: Condvar::new(),
            main_loop: Mutex::new(None),
            thread: Mutex::new(None),
            bound: Mutex::new(Vec::new()),
            logger,
        }
    }

    /// Creates a server whose connections all share one protocol handler,
    /// wired through the plain TCP transport. This is the common case; use
    /// [`new`](TcpServer::new) to substitute a different transport.
    pub fn with_handler<H>(config: ServerConfig, handler: H) -> TcpServer
    where
        H: ConnectionHandler,
    {
        let handler: Arc<dyn ConnectionHandler> = Arc::new(handler);
        let factory: ConnectionFactory = Arc::new(move |stream, owner| {
            let transport = TcpTransport::new(stream)?;
            Ok(Connection::new(owner, Box::new(transport), handler.clone()))
        });
        TcpServer::new(config, factory)
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.lock().unwrap()
    }

    /// Addresses actually bound, with OS-assigned ports resolved. Empty until
    /// [`start`](TcpServer::start) succeeds.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.bound.lock().unwrap().clone()
    }

    /// Connections currently attached across all sub-loops.
    pub fn connection_count(&self) -> usize {
        self.main_loop
            .lock()
            .unwrap()
            .as_ref()
            .map(|main| main.connection_count())
            .unwrap_or(0)
    }

    /// Binds every configured address, creates the loop pool, and spawns the
    /// dedicated server thread running the accept loop.
    pub fn start(&self) -> Result<()> {
        {
            let mut status = self.status.lock().unwrap();
            if *status != ServerStatus::Stopped {
                return Err(Error::State {
                    current: *status,
                    operation: "start",
                });
            }
            *status = ServerStatus::Starting;
        }

        match self.start_inner() {
            Ok(()) => {
                self.set_status(ServerStatus::Running);
                Ok(())
            }
            Err(e) => {
                self.set_status(ServerStatus::Stopped);
                Err(e)
            }
        }
    }

    fn start_inner(&self) -> Result<()> {
        let mut listeners = Vec::with_capacity(self.config.addresses.len());
        let mut bound = Vec::with_capacity(self.config.addresses.len());
        for ip in &self.config.addresses {
            let addr = SocketAddr::new(*ip, self.config.port);
            let listener = TcpListener::bind(addr).map_err(|e| Error::Bind { addr, source: e })?;
            bound.push(listener.local_addr()?);
            listeners.push(listener);
        }

        let poller_factory = self
            .config
            .poller_factory
            .clone()
            .unwrap_or_else(poller::default_factory);
        let options = AcceptOptions {
            no_delay: self.config.no_delay,
            keep_alive: self.config.keep_alive.is_some(),
        };
        let main = MainEventLoop::new(
            self.config.sub_loops,
            poller_factory,
            self.factory.clone(),
            options,
            self.logger.clone(),
        )?;
        for listener in listeners {
            main.add_listener(listener)?;
        }

        let runner = main.clone();
        let logger = self.logger.clone();
        let handle = thread::Builder::new()
            .name("sluice-main".into())
            .spawn(move || {
                if let Err(e) = runner.run() {
                    logger.log(LogLevel::Error, &format!("accept loop exited: {e}"));
                }
            })
            .map_err(Error::Io)?;

        for addr in &bound {
            self.logger
                .log(LogLevel::Info, &format!("listening on {addr}"));
        }
        *self.bound.lock().unwrap() = bound;
        *self.main_loop.lock().unwrap() = Some(main);
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the loop pool and joins the server thread. Safe to call from any
    /// thread; a second call while stopped is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut status = self.status.lock().unwrap();
            match *status {
                ServerStatus::Stopped => return Ok(()),
                ServerStatus::Stopping => {
                    // another thread is already tearing down; wait with them
                    drop(status);
                    self.wait_shutdown();
                    return Ok(());
                }
                _ => *status = ServerStatus::Stopping,
            }
        }

        if let Some(main) = self.main_loop.lock().unwrap().take() {
            main.stop();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.bound.lock().unwrap().clear();
        self.set_status(ServerStatus::Stopped);
        Ok(())
    }

    /// Blocks the caller until the server returns to `Stopped`.
    pub fn wait_shutdown(&self) {
        let mut status = self.status.lock().unwrap();
        while *status != ServerStatus::Stopped {
            status = self.status_changed.wait(status).unwrap();
        }
    }

    /// Fan-out handle over the running loop pool.
    pub fn broadcaster(&self) -> Result<Broadcast> {
        match self.main_loop.lock().unwrap().as_ref() {
            Some(main) => Ok(Broadcast { main: main.clone() }),
            None => Err(Error::State {
                current: self.status(),
                operation: "broadcast",
            }),
        }
    }

    fn set_status(&self, status: ServerStatus) {
        *self.status.lock().unwrap() = status;
        self.status_changed.notify_all();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Sends a payload to every connection on every sub-loop.
///
/// Each sub-loop receives one posted task and iterates its own connection map
/// on its own thread; the single-socket exclusion covers the common "echo to
/// everyone but the sender" case without building a set.
#[derive(Clone)]
pub struct Broadcast {
    main: Arc<MainEventLoop>,
}

impl Broadcast {
    pub fn send(&self, data: &[u8]) {
        self.main.broadcast(data, None);
    }

    pub fn send_except(&self, data: &[u8], excluded: Sock) {
        self.main.broadcast(data, Some(excluded));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::logger::NoOpLogger;
    use std::net::IpAddr;

    struct SinkHandler;

    impl ConnectionHandler for SinkHandler {
        fn on_message(&self, _conn: &Arc<Connection>, input: &mut Buffer) {
            input.consume_all();
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig::builder()
            .address(IpAddr::from([127, 0, 0, 1]))
            .port(0)
            .sub_loops(2)
            .logger(Arc::new(NoOpLogger))
            .build()
    }

    #[test]
    fn test_status_cycle() {
        let server = TcpServer::with_handler(test_config(), SinkHandler);
        assert_eq!(server.status(), ServerStatus::Stopped);

        server.start().unwrap();
        assert_eq!(server.status(), ServerStatus::Running);
        assert_eq!(server.listen_addrs().len(), 1);
        assert_ne!(server.listen_addrs()[0].port(), 0);

        // a second start in Running is refused
        assert!(matches!(server.start(), Err(Error::State { .. })));

        server.shutdown().unwrap();
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(server.listen_addrs().is_empty());

        // shutdown is idempotent
        server.shutdown().unwrap();
    }

    #[test]
    fn test_restart_after_shutdown() {
        let server = TcpServer::with_handler(test_config(), SinkHandler);
        server.start().unwrap();
        server.shutdown().unwrap();
        server.start().unwrap();
        assert_eq!(server.status(), ServerStatus::Running);
        assert_ne!(server.listen_addrs()[0].port(), 0);
        server.shutdown().unwrap();
    }

    #[test]
    fn test_wait_shutdown_unblocks() {
        let server = Arc::new(TcpServer::with_handler(test_config(), SinkHandler));
        server.start().unwrap();
        let waiter = server.clone();
        let handle = thread::spawn(move || waiter.wait_shutdown());
        thread::sleep(std::time::Duration::from_millis(50));
        server.shutdown().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_broadcaster_requires_running_server() {
        let server = TcpServer::with_handler(test_config(), SinkHandler);
        assert!(server.broadcaster().is_err());
        server.start().unwrap();
        assert!(server.broadcaster().is_ok());
        server.shutdown().unwrap();
    }

    #[test]
    fn test_bind_failure_resets_status() {
        let first = TcpServer::with_handler(test_config(), SinkHandler);
        first.start().unwrap();
        let port = first.listen_addrs()[0].port();

        let mut config = test_config();
        config.port = port;
        let second = TcpServer::with_handler(config, SinkHandler);
        assert!(matches!(second.start(), Err(Error::Bind { .. })));
        assert_eq!(second.status(), ServerStatus::Stopped);

        first.shutdown().unwrap();
    }
}
