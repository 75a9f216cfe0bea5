use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::logger::{Logger, NoOpLogger};
use crate::poller::PollerFactory;

/// Configuration for a TCP reactor server.
///
/// Controls the listen addresses, worker-loop pool size, accepted-socket
/// options, and the injected collaborator handles (logger, poller factory).
/// Use `ServerConfig::builder()` for ergonomic construction.
///
/// ## Socket Options
///
/// - `no_delay`: when enabled (default), disables Nagle's algorithm on every
///   accepted socket for lower latency
/// - `keep_alive`: enables `SO_KEEPALIVE` on accepted sockets; probe timing
///   stays with the OS defaults
///
/// ## Pool Sizing
///
/// - `sub_loops`: number of worker event loops; 0 picks the machine's
///   hardware concurrency
#[derive(Clone)]
pub struct ServerConfig {
    /// Addresses to listen on; each is bound to `port`.
    pub addresses: Vec<IpAddr>,
    /// Port shared by every listen address. Use 0 to let the OS pick (the
    /// bound port is reported by `TcpServer::listen_addrs`).
    pub port: u16,
    /// Worker loop count; 0 = hardware concurrency.
    pub sub_loops: usize,
    /// Enable TCP_NODELAY on accepted sockets.
    pub no_delay: bool,
    /// SO_KEEPALIVE setting for accepted sockets.
    pub keep_alive: Option<Duration>,
    /// Logger for reactor diagnostics.
    pub logger: Arc<dyn Logger>,
    /// Poller backend override; `None` uses the platform default.
    pub poller_factory: Option<PollerFactory>,
}

impl ServerConfig {
    /// Create a new builder for `ServerConfig`.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Parses a listen address, mapping a malformed string to
    /// [`Error::InvalidAddress`](crate::error::Error::InvalidAddress).
    pub fn parse_address(addr: &str) -> crate::error::Result<IpAddr> {
        addr.parse()
            .map_err(|_| crate::error::Error::InvalidAddress(addr.to_string()))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addresses: vec![IpAddr::from([127, 0, 0, 1])],
            port: 8080,
            sub_loops: 0,
            no_delay: true,
            keep_alive: None,
            logger: Arc::new(NoOpLogger),
            poller_factory: None,
        }
    }
}

/// Builder for [`ServerConfig`].
///
/// All fields are optional and fall back to `ServerConfig::default()` when
/// not set.
pub struct ServerConfigBuilder {
    addresses: Option<Vec<IpAddr>>,
    port: Option<u16>,
    sub_loops: Option<usize>,
    no_delay: Option<bool>,
    keep_alive: Option<Option<Duration>>,
    logger: Option<Arc<dyn Logger>>,
    poller_factory: Option<PollerFactory>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            addresses: None,
            port: None,
            sub_loops: None,
            no_delay: None,
            keep_alive: None,
            logger: None,
            poller_factory: None,
        }
    }

    /// Add one listen address.
    pub fn address(mut self, address: IpAddr) -> Self {
        self.addresses.get_or_insert_with(Vec::new).push(address);
        self
    }

    /// Replace the whole listen address list.
    pub fn addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.addresses = Some(addresses);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the worker loop count (0 = hardware concurrency).
    pub fn sub_loops(mut self, count: usize) -> Self {
        self.sub_loops = Some(count);
        self
    }

    /// Enable or disable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Set SO_KEEPALIVE duration.
    pub fn keep_alive(mut self, duration: Option<Duration>) -> Self {
        self.keep_alive = Some(duration);
        self
    }

    /// Set the logger implementation.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Set a custom poller backend factory.
    pub fn poller_factory(mut self, factory: PollerFactory) -> Self {
        self.poller_factory = Some(factory);
        self
    }

    /// Build the `ServerConfig`.
    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            addresses: self.addresses.unwrap_or(default.addresses),
            port: self.port.unwrap_or(default.port),
            sub_loops: self.sub_loops.unwrap_or(default.sub_loops),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            logger: self.logger.unwrap_or(default.logger),
            poller_factory: self.poller_factory.or(default.poller_factory),
        }
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_falls_back_to_defaults() {
        let config = ServerConfig::builder().port(9000).build();
        assert_eq!(config.port, 9000);
        assert_eq!(config.addresses, vec![IpAddr::from([127, 0, 0, 1])]);
        assert_eq!(config.sub_loops, 0);
        assert!(config.no_delay);
    }

    #[test]
    fn test_parse_address() {
        assert!(ServerConfig::parse_address("10.0.0.1").is_ok());
        assert!(matches!(
            ServerConfig::parse_address("not-an-ip"),
            Err(crate::error::Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_builder_accumulates_addresses() {
        let config = ServerConfig::builder()
            .address(IpAddr::from([127, 0, 0, 1]))
            .address(IpAddr::from([0, 0, 0, 0]))
            .build();
        assert_eq!(config.addresses.len(), 2);
    }
}
