//! TCP listener with backpressure.
//!
//! # Responsibilities
//! - Bind a listening port for the request queue
//! - Enforce max_connections via semaphore
//! - Hand each accepted stream out with its connection permit

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to accept: {0}")]
    Accept(#[source] std::io::Error),
    #[error("Listener closed")]
    Closed,
}

/// A bounded TCP listener.
///
/// When `max_connections` streams are open, `accept` waits for a slot.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;

        tracing::info!(
            address = %addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(max_connections.max(1))),
            max_connections,
        })
    }

    /// Accept a connection. The permit must live as long as the connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_released() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 2).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, _, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 1);
        drop(permit);
        assert_eq!(listener.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = Listener::bind("127.0.0.1:0".parse().unwrap(), 1).await.unwrap();
        let addr = first.local_addr().unwrap();
        let err = Listener::bind(addr, 1).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }
}
