//! Bounded-concurrency TCP acceptor.
//!
//! Connections are accepted without limit, but each must take an admission
//! slot before its handler task is spawned. While every slot is taken the
//! accept loop itself waits, so at most `max_connections` handlers run at
//! once. The slot is an owned semaphore permit moved into the task and
//! released on drop, which covers normal return, early return and panics.

use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::config::normalize_listen_addr;
use crate::error::{ProxyError, Result};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Pause before retrying after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    MIN_ACCEPT_BACKOFF
        .saturating_mul(factor)
        .min(MAX_ACCEPT_BACKOFF)
}

/// Per-connection unit of work run by the [`Acceptor`].
///
/// The handler owns the stream; the connection closes when it is dropped,
/// at the latest when `handle` returns.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream);
}

#[async_trait]
impl<F, Fut> ConnectionHandler for F
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, stream: TcpStream) {
        (self)(stream).await
    }
}

pub struct Acceptor {
    listener: TcpListener,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl Acceptor {
    /// Bind `addr` (`host:port` or `:port`) with `max_connections` slots.
    ///
    /// A capacity of zero is raised to one so the acceptor can make progress.
    pub async fn bind(addr: &str, max_connections: usize) -> Result<Self> {
        let addr = normalize_listen_addr(addr);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let max_connections = max_connections.max(1);

        if let Ok(local) = listener.local_addr() {
            info!("Listening on {} ({} connection slots)", local, max_connections);
        }

        Ok(Self {
            listener,
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Slots not currently held by a running handler.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Accept connections forever, running `handler` for each admitted one.
    ///
    /// Accept errors are logged and the loop continues after a short pause,
    /// which grows while the errors persist (e.g. out of file descriptors).
    pub async fn serve<H>(self, handler: H)
    where
        H: ConnectionHandler,
    {
        let handler = Arc::new(handler);
        let mut failures = 0u32;
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    error!("{}", ProxyError::Accept(e));
                    tokio::time::sleep(accept_backoff(failures)).await;
                    continue;
                }
            };

            let permit = match self.slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Connection slot pool closed, stopping accept loop");
                    return;
                }
            };
            debug!(
                "Admitted {} ({} slots free)",
                peer,
                self.slots.available_permits()
            );

            let handler = handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                handler.handle(stream).await;
                debug!("Released slot for {}", peer);
            });
        }
    }
}

/// Bind `addr` and serve `handler` on it.
///
/// Only returns on a bind failure; the accept loop never terminates.
pub async fn listen<H>(addr: &str, max_connections: usize, handler: H) -> Result<()>
where
    H: ConnectionHandler,
{
    let acceptor = Acceptor::bind(addr, max_connections).await?;
    acceptor.serve(handler).await;
    Ok(())
}
