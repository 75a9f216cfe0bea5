//! TCP networking layer built on the reactor core.
//!
//! The pieces compose bottom-up: a [`transport::Transport`] moves raw bytes
//! between a socket and the connection's buffers; a
//! [`connection::Connection`] runs the per-socket state machine and calls the
//! application's [`connection::ConnectionHandler`] hooks; a
//! [`server::TcpServer`] binds listeners, owns the loop pool, and fans
//! accepted sockets out to worker loops.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │       ┌──────────────┐          ┌────────────────────┐      │
//! │       │  TcpServer   │─────────▶│ ConnectionHandler  │      │
//! │       └──────────────┘          └────────────────────┘      │
//! └────────────┬──────────────────────────┬─────────────────────┘
//!              │ bind + start             │ on_connected, on_message, ...
//!              ▼                          │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  MainEventLoop ──accept──▶ sub EventLoop (one per thread)   │
//! │        │                        │                           │
//! │   listener Channel         Connection ──▶ Transport         │
//! └────────────┬────────────────────┬───────────────────────────┘
//!              │ readiness          │ recv/send
//!              ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Poller (epoll / poll / WSAPoll)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Framing is entirely the handler's concern: `on_message` consumes the bytes
//! it has fully parsed and leaves partial frames in the buffer for the next
//! delivery.

pub mod config;
pub mod connection;
pub mod server;
pub mod transport;
