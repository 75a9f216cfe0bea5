//! Line-oriented chat room: every line a client sends is broadcast to all
//! other clients across every worker loop.
//!
//! Run with `cargo run --example chat_server`, then connect a few terminals
//! with `nc 127.0.0.1 8080`.

use std::sync::{Arc, Mutex};

use sluice_io::net::config::ServerConfig;
use sluice_io::net::connection::{Connection, ConnectionHandler};
use sluice_io::net::server::{Broadcast, TcpServer};
use sluice_io::prelude::StderrLogger;
use sluice_io::Buffer;

struct ChatHandler {
    broadcast: Mutex<Option<Broadcast>>,
}

impl ChatHandler {
    fn room(&self) -> Option<Broadcast> {
        self.broadcast.lock().unwrap().clone()
    }
}

impl ConnectionHandler for ChatHandler {
    fn on_connected(&self, conn: &Arc<Connection>) {
        if let Some(room) = self.room() {
            let notice = format!("* {:?} joined\n", conn.peer_addr());
            room.send_except(notice.as_bytes(), conn.sock());
        }
    }

    fn on_message(&self, conn: &Arc<Connection>, input: &mut Buffer) {
        // forward only complete lines; partial lines stay buffered
        while let Some(pos) = input.peek().iter().position(|&b| b == b'\n') {
            let line = input.peek()[..=pos].to_vec();
            input.consume(pos + 1);
            if let Some(room) = self.room() {
                room.send_except(&line, conn.sock());
            }
        }
    }

    fn on_closed(&self, conn: &Arc<Connection>) {
        if let Some(room) = self.room() {
            let notice = format!("* {:?} left\n", conn.peer_addr());
            room.send_except(notice.as_bytes(), conn.sock());
        }
    }
}

fn main() -> sluice_io::Result<()> {
    let handler = Arc::new(ChatHandler {
        broadcast: Mutex::new(None),
    });

    let config = ServerConfig::builder()
        .address(ServerConfig::parse_address("127.0.0.1")?)
        .port(8080)
        .logger(Arc::new(StderrLogger))
        .build();

    let server = TcpServer::new(config, {
        let handler = handler.clone();
        Arc::new(move |stream, owner| {
            let transport = sluice_io::net::transport::TcpTransport::new(stream)?;
            Ok(Connection::new(owner, Box::new(transport), handler.clone()))
        })
    });
    server.start()?;
    *handler.broadcast.lock().unwrap() = Some(server.broadcaster()?);

    println!("chat server listening on {:?}", server.listen_addrs());
    server.wait_shutdown();
    Ok(())
}
