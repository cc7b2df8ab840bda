use std::time::Duration;

use crate::{CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS, FORWARD_TIMEOUT, READ_TIMEOUT};

/// Tuning knobs shared by the proxy and the file server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Admission slots in the acceptor's pool.
    pub max_connections: usize,
    /// Deadline for reading a complete inbound request.
    pub read_timeout: Duration,
    /// Deadline for opening the outbound connection.
    pub connect_timeout: Duration,
    /// Deadline for each of reading the origin's response head and body.
    pub forward_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            read_timeout: READ_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            forward_timeout: FORWARD_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }
}

/// Expand the `:port` shorthand to bind every interface.
pub fn normalize_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}
