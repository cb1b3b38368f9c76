//! Socket Endpoint Wrappers
//!
//! Thin wrappers over the tokio UDP and TCP sockets a target owns. A target
//! holds each endpoint as an `Option`; closing is dropping, which is
//! idempotent and makes any receive pending on the socket complete with an
//! error instead of hanging.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::error::{NetworkError, Result};

/// UDP endpoint for discovery broadcast and per-target control datagrams
#[derive(Debug, Clone)]
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
}

impl UdpEndpoint {
    /// Bind a fresh socket on an ephemeral local port
    pub async fn bind(bind_address: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_address).await.map_err(|e| {
            NetworkError::network_with_source(
                format!("Failed to bind UDP socket on {bind_address}"),
                e,
            )
        })?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Allow sending to the subnet broadcast address (discovery socket only)
    pub fn enable_broadcast(&self) -> Result<()> {
        self.socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::network_with_source("Failed to enable broadcast", e))
    }

    /// Associate the socket with one remote peer so `send` works
    pub async fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.socket.connect(remote).await.map_err(|e| {
            NetworkError::connection_with_source(
                "Failed to connect UDP socket",
                Some(remote),
                e,
            )
        })
    }

    /// Send a datagram to the connected peer
    pub async fn send(&self, bytes: &[u8]) -> Result<usize> {
        let sent = self
            .socket
            .send(bytes)
            .await
            .map_err(|e| NetworkError::network_with_source("Failed to send UDP datagram", e))?;
        debug!(bytes = sent, "Sent UDP datagram");
        Ok(sent)
    }

    /// Send a datagram to an explicit address (unconnected mode)
    pub async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<usize> {
        let sent = self.socket.send_to(bytes, addr).await.map_err(|e| {
            NetworkError::network_with_source(format!("Failed to send UDP datagram to {addr}"), e)
        })?;
        debug!(bytes = sent, peer = %addr, "Sent UDP datagram");
        Ok(sent)
    }

    /// Receive one datagram with its sender
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| NetworkError::network_with_source("Failed to receive UDP datagram", e))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::network_with_source("Failed to get local address", e))
    }
}

/// Write side of a target's TCP logging connection.
///
/// The read half is handed to the completion engine at connect time and
/// lives inside the target's reader task.
#[derive(Debug)]
pub struct TcpEndpoint {
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
}

impl TcpEndpoint {
    /// Connect with a bounded timeout, returning the write-half endpoint and
    /// the read half for the completion engine.
    pub async fn connect(
        remote: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<(Self, OwnedReadHalf)> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| {
                NetworkError::timeout("TCP connect", connect_timeout.as_millis() as u64)
            })?
            .map_err(|e| {
                NetworkError::connection_with_source(
                    "Failed to connect to TCP peer",
                    Some(remote),
                    e,
                )
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let peer_addr = stream.peer_addr().map_err(|e| {
            NetworkError::connection_with_source("Failed to get peer address", Some(remote), e)
        })?;

        let (read_half, writer) = stream.into_split();
        debug!(peer = %peer_addr, "TCP connection established");
        Ok((Self { writer, peer_addr }, read_half))
    }

    /// Send raw frame bytes over the stream
    pub async fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|e| NetworkError::network_with_source("Failed to write to TCP stream", e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| NetworkError::network_with_source("Failed to flush TCP stream", e))?;
        Ok(bytes.len())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Drop for TcpEndpoint {
    // Dropping the write half sends the FIN; there is no separate close.
    fn drop(&mut self) {
        debug!(peer = %self.peer_addr, "TCP endpoint closed");
    }
}
