//! Bounded-concurrency TCP acceptor and an in-memory caching HTTP forward
//! proxy built on it.
//!
//! The [`Acceptor`] admits at most `max_connections` concurrent handlers and
//! dispatches each connection to a [`ConnectionHandler`]. [`ProxyHandler`]
//! answers GETs from a shared [`CacheStore`], forwarding misses to the origin
//! named by the absolute request target; [`FileHandler`] serves and stores
//! files under a directory.

use std::time::Duration;

pub mod acceptor;
pub mod cache;
pub mod config;
pub mod error;
pub mod file_server;
pub mod forward;
pub mod http;
pub mod proxy;

pub use acceptor::{listen, Acceptor, ConnectionHandler};
pub use cache::{CacheEntry, CacheStore};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use file_server::FileHandler;
pub use forward::{Forward, TcpForwarder};
pub use http::{Request, Response, StatusCode};
pub use proxy::ProxyHandler;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const MAX_REQUEST_SIZE: usize = 64 * 1024; // Request and response heads
pub const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // Buffered bodies
pub const MAX_HEADERS: usize = 64;
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
