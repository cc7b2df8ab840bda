use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result, Stage};
use crate::http::{read_response_body, read_response_head, Request, Response};

/// Relays a request to its origin and returns the buffered response.
///
/// Implementations distinguish dial failures and unreadable response heads
/// ([`ProxyError::Dial`], [`ProxyError::ForwardRead`]) from failures while
/// buffering the body ([`ProxyError::BodyRead`]).
#[async_trait]
pub trait Forward: Send + Sync + 'static {
    async fn forward(&self, request: &Request) -> Result<Response>;
}

/// Opens one outbound TCP connection per call and closes it on return.
#[derive(Clone, Debug)]
pub struct TcpForwarder {
    connect_timeout: Duration,
    forward_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            forward_timeout: config.forward_timeout,
        }
    }
}

impl Default for TcpForwarder {
    fn default() -> Self {
        Self::new(&ProxyConfig::default())
    }
}

#[async_trait]
impl Forward for TcpForwarder {
    async fn forward(&self, request: &Request) -> Result<Response> {
        let authority = target_authority(request).ok_or_else(|| ProxyError::Dial {
            authority: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "request names no origin"),
        })?;
        let (host, port) = split_authority(authority).ok_or_else(|| ProxyError::Dial {
            authority: authority.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "invalid origin authority"),
        })?;

        let stream = match timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ProxyError::Dial {
                    authority: authority.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ProxyError::Timeout {
                    stage: Stage::Connect,
                    after: self.connect_timeout,
                })
            }
        };
        debug!("Forwarding {} to {}:{}", request.target, host, port);

        // Owned by this call: dropping it on any return path closes the socket.
        let mut upstream = BufReader::new(stream);
        upstream
            .get_mut()
            .write_all(&request.to_bytes())
            .await
            .map_err(|e| ProxyError::ForwardRead(format!("failed to send request: {e}")))?;

        let head = timeout(self.forward_timeout, read_response_head(&mut upstream))
            .await
            .map_err(|_| ProxyError::Timeout {
                stage: Stage::Response,
                after: self.forward_timeout,
            })??;
        let body = timeout(
            self.forward_timeout,
            read_response_body(&mut upstream, &head, &request.method),
        )
        .await
        .map_err(|_| ProxyError::Timeout {
            stage: Stage::Body,
            after: self.forward_timeout,
        })??;

        Ok(Response {
            status: head.status,
            headers: head.headers,
            body,
        })
    }
}

/// Origin authority for a request, taken only from an absolute-form target.
///
/// An origin-form target names no origin even when a `Host` header is
/// present; that header usually names this proxy.
pub fn target_authority(request: &Request) -> Option<&str> {
    request.authority().filter(|a| !a.is_empty())
}

/// Split `host[:port]` into host and port, defaulting the port to 80.
pub fn split_authority(authority: &str) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    // Bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => 80,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), 80)),
    }
}
