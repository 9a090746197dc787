//! Transport shim (§6 "Transport").
//!
//! The real secure stream — certificate pinning, handshake, keepalive,
//! multiplexing — is explicitly out of scope (§1); this module stands in
//! for it with a plain TCP stream and the one contract the core depends on:
//! a 3-second open timeout, and a peer address string for fan-out's `address`
//! reserved constant.

use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

/// Stream open/accept has a 3-second timeout (§5 "Cancellation & timeouts").
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection attempt timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Opens a connection to `addr`, failing with [`TransportError::Timeout`]
/// if it does not complete within [`OPEN_TIMEOUT`].
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(OPEN_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    Ok(stream)
}

/// Binds a listener accepting agent/operator connections.
pub async fn listen<A: ToSocketAddrs>(addr: A) -> Result<TcpListener, TransportError> {
    Ok(TcpListener::bind(addr).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_refused_surfaces_as_io_error() {
        let err = connect("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)) || matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn listen_then_connect_round_trips() {
        let listener = listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });
        let client = connect(addr).await.unwrap();
        let (server, _) = accept.await.unwrap().unwrap();
        assert_eq!(
            client.local_addr().unwrap().ip(),
            server.peer_addr().unwrap().ip()
        );
    }
}
