//! Minimal echo server: every received chunk is written straight back.
//!
//! Run with `cargo run --example echo_server`, then:
//! ```text
//! $ nc 127.0.0.1 8080
//! hello
//! hello
//! ```

use std::sync::Arc;

use sluice_io::net::config::ServerConfig;
use sluice_io::net::connection::{Connection, ConnectionHandler};
use sluice_io::net::server::TcpServer;
use sluice_io::prelude::StderrLogger;
use sluice_io::Buffer;

struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_connected(&self, conn: &Arc<Connection>) {
        println!("connected: {:?}", conn.peer_addr());
    }

    fn on_message(&self, conn: &Arc<Connection>, input: &mut Buffer) {
        let data = input.read_all();
        conn.send(&data);
    }

    fn on_closed(&self, conn: &Arc<Connection>) {
        println!("closed: {:?}", conn.peer_addr());
    }
}

fn main() -> sluice_io::Result<()> {
    let config = ServerConfig::builder()
        .address(ServerConfig::parse_address("127.0.0.1")?)
        .port(8080)
        .logger(Arc::new(StderrLogger))
        .build();

    let server = TcpServer::with_handler(config, EchoHandler);
    server.start()?;
    println!("echo server listening on {:?}", server.listen_addrs());
    server.wait_shutdown();
    Ok(())
}
