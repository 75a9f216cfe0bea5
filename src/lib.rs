//! # Sluice-IO
//! An embeddable, cross-platform asynchronous network reactor for Rust:
//! multi-loop event-driven I/O without a heavyweight async runtime.
//! Sluice-IO accepts TCP connections on a main loop, fans each accepted
//! socket out to a pool of worker loops, and drives a per-connection state
//! machine from readiness events: the substrate on which application
//! protocol servers (HTTP, custom binary protocols, TLS-capable services)
//! are built.
//!
//! ## Core Philosophy
//! Sluice-IO was designed for applications that require:
//! - **Predictable performance** with minimal runtime overhead
//! - **Runtime-agnostic architecture** that doesn't force async/await patterns
//! - **Direct control** over concurrency and resource management
//! - **Minimal dependencies** for reduced attack surface and faster builds
//!
//! ## Features
//! - **Multi-loop reactor**: one accept loop plus N single-threaded worker
//!   loops (default: hardware concurrency); a connection is pinned to one
//!   loop for its entire lifetime, so protocol callbacks never need locks
//! - **Pluggable pollers**: an edge-triggered epoll backend on Linux and a
//!   portable `poll`/`WSAPoll` emulation elsewhere, both injectable for tests
//! - **Transport abstraction**: raw byte I/O is separated from connection
//!   logic, with handshake hooks reserved for a future encrypted transport
//! - **Cross-thread posting**: any thread can send, shut down, or broadcast;
//!   requests are marshalled to the owning loop through a task queue and a
//!   self-wakeup pipe
//! - **Clean API**: implement one trait method (`on_message`) and go
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐     ┌───────────────┐     ┌──────────────┐
//! │  TcpServer  │────▶│ MainEventLoop │────▶│ sub loops ×N │
//! └─────────────┘     └───────────────┘     └──────────────┘
//!                             │                     │
//!                          accept             ┌─────────────┐
//!                             │               │ Connection  │
//!                             ▼               │  + Channel  │
//!                      round-robin ──────────▶│  + Buffers  │
//!                                             └─────────────┘
//!                                                    │
//!                                             ┌─────────────┐
//!                                             │   Poller    │
//!                                             │(epoll/poll) │
//!                                             └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sluice_io::net::config::ServerConfig;
//! use sluice_io::net::connection::{Connection, ConnectionHandler};
//! use sluice_io::net::server::TcpServer;
//! use sluice_io::Buffer;
//! use std::sync::Arc;
//!
//! struct EchoHandler;
//!
//! impl ConnectionHandler for EchoHandler {
//!     fn on_message(&self, conn: &Arc<Connection>, input: &mut Buffer) {
//!         let data = input.read_all();
//!         conn.send(&data);
//!     }
//! }
//!
//! fn main() -> sluice_io::Result<()> {
//!     let config = ServerConfig::builder()
//!         .address(ServerConfig::parse_address("127.0.0.1")?)
//!         .port(8080)
//!         .build();
//!
//!     let server = TcpServer::with_handler(config, EchoHandler);
//!     server.start()?;
//!     println!("echo server listening on {:?}", server.listen_addrs());
//!     server.wait_shutdown();
//!     Ok(())
//! }
//! ```
//!
//! - [`net::server::TcpServer`]: lifecycle wrapper (bind, start, shutdown)
//! - [`net::connection::ConnectionHandler`]: trait for protocol callbacks
//! - [`event_loop::EventLoop`]: single-threaded reactor loop (advanced usage)
//! - [`main_loop::MainEventLoop`]: accept loop and worker pool (advanced usage)
//! - [`poller`]: readiness-multiplexing backends and the poller factory
//! - [`error`]: error types and result handling

pub mod buffer;
pub mod channel;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod logger;
pub mod main_loop;
pub mod net;
pub mod poller;
mod sys;
pub mod utils;
mod wakeup;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use event::IoEvent;
pub use sys::Sock;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use sluice_io::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::error::{Error, Result};
    pub use crate::event::IoEvent;
    pub use crate::event_loop::EventLoop;
    pub use crate::logger::{LogLevel, Logger, NoOpLogger, StderrLogger};
    pub use crate::main_loop::MainEventLoop;
    pub use crate::net::config::ServerConfig;
    pub use crate::net::connection::{Connection, ConnectionHandler, ConnectionState};
    pub use crate::net::server::{Broadcast, ServerStatus, TcpServer};
    pub use crate::net::transport::{IoResult, TcpTransport, Transport};
}
