//! Server configuration.

use std::net::IpAddr;
use std::time::Duration;

use tracing::{info, warn};

use crate::errors::ConfigError;

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: i64 = 300;
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(3);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(200);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Validated, immutable server settings.
///
/// Build one with [`ServerConfig::builder`]; the only way out of the
/// builder is [`ServerConfigBuilder::build`], which validates every field.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    bind_address: String,
    port: u16,
    require_auth: bool,
    max_connections: usize,
    connection_timeout: Duration,
    buffer_size: usize,
    terminate_grace: Duration,
    shutdown_grace: Duration,
    keepalive_interval: Duration,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn require_auth(&self) -> bool {
        self.require_auth
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Idle limit for a terminal session. `None` when disabled (configured as 0).
    pub fn connection_timeout(&self) -> Option<Duration> {
        (!self.connection_timeout.is_zero()).then_some(self.connection_timeout)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn terminate_grace(&self) -> Duration {
        self.terminate_grace
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// `host:port` string handed to the listener.
    pub fn listen_addr(&self) -> String {
        match self.bind_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.bind_address, self.port),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        is_wildcard_address(&self.bind_address)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            require_auth: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS as u64),
            buffer_size: DEFAULT_BUFFER_SIZE,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

/// Raw, unchecked settings. Wider integer types than the validated config
/// so out-of-range input reaches validation instead of failing to parse.
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    bind_address: String,
    port: u32,
    require_auth: bool,
    max_connections: usize,
    connection_timeout_secs: i64,
    buffer_size: usize,
    terminate_grace: Duration,
    shutdown_grace: Duration,
    keepalive_interval: Duration,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind_address: defaults.bind_address,
            port: u32::from(defaults.port),
            require_auth: defaults.require_auth,
            max_connections: defaults.max_connections,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            buffer_size: defaults.buffer_size,
            terminate_grace: defaults.terminate_grace,
            shutdown_grace: defaults.shutdown_grace,
            keepalive_interval: defaults.keepalive_interval,
        }
    }
}

impl ServerConfigBuilder {
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    pub fn require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn connection_timeout_secs(mut self, secs: i64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Validate every field and freeze the configuration.
    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let bind_address = self.bind_address.trim().to_string();
        if bind_address.is_empty() {
            return Err(ConfigError::EmptyBindAddress);
        }
        let port = match u16::try_from(self.port) {
            Ok(port) if port >= 1 => port,
            _ => return Err(ConfigError::InvalidPort(self.port)),
        };
        if self.max_connections < 1 {
            return Err(ConfigError::InvalidMaxConnections(self.max_connections));
        }
        if self.connection_timeout_secs < 0 {
            return Err(ConfigError::NegativeTimeout(self.connection_timeout_secs));
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::InvalidBufferSize {
                got: self.buffer_size,
                max: MAX_BUFFER_SIZE,
            });
        }
        if self.require_auth {
            return Err(ConfigError::AuthUnsupported);
        }

        if is_wildcard_address(&bind_address) {
            warn!(
                bind_address = %bind_address,
                "Server binding to all interfaces - this exposes the tunnel to the network"
            );
        } else if is_loopback_address(&bind_address) {
            info!(bind_address = %bind_address, "Server binding to localhost only");
        } else {
            info!(bind_address = %bind_address, "Server binding to specific address");
        }

        Ok(ServerConfig {
            bind_address,
            port,
            require_auth: false,
            max_connections: self.max_connections,
            connection_timeout: Duration::from_secs(self.connection_timeout_secs as u64),
            buffer_size: self.buffer_size,
            terminate_grace: self.terminate_grace,
            shutdown_grace: self.shutdown_grace,
            keepalive_interval: self.keepalive_interval,
        })
    }
}

pub fn is_wildcard_address(addr: &str) -> bool {
    match addr.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        Ok(ip) => ip.is_unspecified(),
        Err(_) => false,
    }
}

pub fn is_loopback_address(addr: &str) -> bool {
    if addr.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match addr.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => false,
    }
}
