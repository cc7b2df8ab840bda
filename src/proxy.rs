//! Caching forward proxy handler.
//!
//! Each connection carries one request. GETs are answered from the cache when
//! the exact target was fetched before; otherwise they are forwarded, the
//! buffered response is stored and then served. Every other method gets 501.
//! Each path writes exactly one response.
//!
//! Concurrent misses for the same target are not coalesced: each forwards
//! independently and the last store wins.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::acceptor::ConnectionHandler;
use crate::cache::{CacheEntry, CacheStore};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::forward::{Forward, TcpForwarder};
use crate::http::{serve_one, Request, Response};

pub struct ProxyHandler<F = TcpForwarder> {
    cache: CacheStore,
    forwarder: F,
    read_timeout: Duration,
}

impl ProxyHandler<TcpForwarder> {
    pub fn new(config: &ProxyConfig, cache: CacheStore) -> Self {
        Self::with_forwarder(config, cache, TcpForwarder::new(config))
    }
}

impl<F: Forward> ProxyHandler<F> {
    pub fn with_forwarder(config: &ProxyConfig, cache: CacheStore, forwarder: F) -> Self {
        Self {
            cache,
            forwarder,
            read_timeout: config.read_timeout,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Read one request from `stream` and answer it.
    pub async fn serve_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        serve_one(stream, self.read_timeout, |request| async move {
            self.handle_request(&request).await
        })
        .await
    }

    /// Answer a parsed request from the cache or the origin.
    pub async fn handle_request(&self, request: &Request) -> Result<Response> {
        if request.method != "GET" {
            return Err(ProxyError::UnsupportedMethod(request.method.clone()));
        }

        let key = request.target.as_str();
        if let Some(cached) = self.cache.get(key).await {
            info!("CACHE HIT: {}", key);
            return Ok(cached.to_response());
        }
        debug!("CACHE MISS: {}", key);

        let fresh = self.forwarder.forward(request).await?;
        let entry = CacheEntry::from_response(&fresh);
        let response = entry.to_response();
        self.cache.put(key, entry).await;
        info!("CACHED: {} ({})", key, fresh.status);
        Ok(response)
    }
}

#[async_trait]
impl<F: Forward> ConnectionHandler for ProxyHandler<F> {
    async fn handle(&self, stream: TcpStream) {
        self.serve_connection(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serves a fixed response or error and counts calls.
    struct StubOrigin {
        calls: Arc<AtomicUsize>,
        outcome: fn() -> Result<Response>,
    }

    #[async_trait]
    impl Forward for StubOrigin {
        async fn forward(&self, _request: &Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    fn hello() -> Result<Response> {
        Ok(Response::new(StatusCode::OK, "<h1>Hello</h1>")
            .with_header("Content-Type", "text/html")
            .with_header("Transfer-Encoding", "chunked"))
    }

    fn proxy_with(outcome: fn() -> Result<Response>) -> (ProxyHandler<StubOrigin>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let stub = StubOrigin {
            calls: calls.clone(),
            outcome,
        };
        let handler = ProxyHandler::with_forwarder(&ProxyConfig::default(), CacheStore::new(), stub);
        (handler, calls)
    }

    async fn exchange(handler: &ProxyHandler<StubOrigin>, raw: &[u8]) -> String {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(raw).await.unwrap();
        handler.serve_connection(server).await;
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (handler, calls) = proxy_with(hello);
        let raw = b"GET http://origin/a.html HTTP/1.1\r\nHost: origin\r\n\r\n";

        let first = exchange(&handler, raw).await;
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"), "{first}");
        assert!(first.contains("Content-Type: text/html\r\n"));
        assert!(first.contains("Content-Length: 14\r\n"));
        assert!(!first.contains("Transfer-Encoding"));
        assert!(first.ends_with("\r\n\r\n<h1>Hello</h1>"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second = exchange(&handler, raw).await;
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entry = handler.cache().get("http://origin/a.html").await.unwrap();
        assert_eq!(entry.status, StatusCode::OK);
        assert_eq!(entry.content_type, "text/html");
    }

    #[tokio::test]
    async fn test_non_get_bypasses_cache() {
        let (handler, calls) = proxy_with(hello);
        for method in ["POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"] {
            let raw = format!("{method} http://origin/a.html HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
            let out = exchange(&handler, raw.as_bytes()).await;
            assert!(out.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{out}");
            assert!(out.ends_with("501 Not Implemented\n"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(handler.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_non_get_ignores_cached_entry() {
        let (handler, _) = proxy_with(hello);
        let entry = CacheEntry::from_response(&hello().unwrap());
        handler.cache().put("http://origin/a.html", entry.clone()).await;

        let out = exchange(&handler, b"POST http://origin/a.html HTTP/1.1\r\nContent-Length: 1\r\n\r\nx").await;
        assert!(out.starts_with("HTTP/1.1 501"));
        assert_eq!(handler.cache().get("http://origin/a.html").await, Some(entry));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let (handler, calls) = proxy_with(hello);
        let out = exchange(&handler, b"BAD REQUEST\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_forward_failure_gets_502_and_no_store() {
        fn refused() -> Result<Response> {
            Err(ProxyError::Dial {
                authority: "origin:80".into(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            })
        }
        let (handler, calls) = proxy_with(refused);
        let out = exchange(&handler, b"GET http://origin/b.html HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{out}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handler.cache().get("http://origin/b.html").await.is_none());
    }

    #[tokio::test]
    async fn test_body_read_failure_gets_500_and_no_store() {
        fn truncated() -> Result<Response> {
            Err(ProxyError::BodyRead("connection reset".into()))
        }
        let (handler, _) = proxy_with(truncated);
        let out = exchange(&handler, b"GET http://origin/c.html HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{out}");
        assert!(handler.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_query_strings_are_distinct_keys() {
        let (handler, calls) = proxy_with(hello);
        exchange(&handler, b"GET http://origin/a.html?v=1 HTTP/1.1\r\n\r\n").await;
        exchange(&handler, b"GET http://origin/a.html?v=2 HTTP/1.1\r\n\r\n").await;
        exchange(&handler, b"GET http://origin/a.html?v=1 HTTP/1.1\r\n\r\n").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler.cache().len().await, 2);
    }

    #[tokio::test]
    async fn test_request_read_timeout_gets_400() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stub = StubOrigin {
            calls: calls.clone(),
            outcome: hello,
        };
        let config = ProxyConfig {
            read_timeout: Duration::from_millis(50),
            ..ProxyConfig::default()
        };
        let handler = ProxyHandler::with_forwarder(&config, CacheStore::new(), stub);

        let (mut client, server) = tokio::io::duplex(1024);
        // Incomplete head, never finished.
        client.write_all(b"GET http://origin/a HTTP/1.1\r\n").await.unwrap();
        handler.serve_connection(server).await;
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
