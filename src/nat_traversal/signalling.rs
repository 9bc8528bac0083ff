/**
 * nat_traversal/signalling.rs
 *
 * Control channel client for the rendezvous server
 */

use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, info};

use super::reusable_socket::{enable_reuse, SocketError};
use crate::protocol::{
    read_message, write_message, DialRequest, DialResponse, ProtocolError, MAX_MESSAGE_LEN,
};

/// Open control connection to the rendezvous server
pub struct SignallingClient {
    stream: TcpStream,
    local_addr: SocketAddr,
    server_addr: SocketAddr,
}

/// Control channel errors
#[derive(Debug, Error)]
pub enum SignallingError {
    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} has no IPv4 address")]
    NoIpv4(String),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("enabling reuse on control connection failed: {0}")]
    Reuse(#[from] SocketError),

    #[error("exchange with {addr} failed: {source}")]
    Exchange {
        addr: SocketAddr,
        #[source]
        source: ProtocolError,
    },
}

impl SignallingClient {
    /// Connect to the rendezvous endpoint ("host:port") over IPv4.
    ///
    /// Reuse is switched on right after the connect, before any traffic, so
    /// the local tuple of this connection can be bound again for punching.
    pub async fn connect(server: &str) -> Result<Self, SignallingError> {
        let server_addr = lookup_host(server)
            .await
            .map_err(|source| SignallingError::Resolve {
                addr: server.to_string(),
                source,
            })?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| SignallingError::NoIpv4(server.to_string()))?;

        let stream = TcpStream::connect(server_addr)
            .await
            .map_err(|source| SignallingError::Connect {
                addr: server_addr,
                source,
            })?;

        enable_reuse(&stream)?;

        let local_addr = stream.local_addr().map_err(|source| SignallingError::Connect {
            addr: server_addr,
            source,
        })?;

        info!("dialed rendezvous server: {} -> {}", local_addr, server_addr);

        Ok(Self {
            stream,
            local_addr,
            server_addr,
        })
    }

    /// Local address:port of the control connection
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Send the registration and block for the peer's addresses
    pub async fn exchange(&mut self, request: &DialRequest) -> Result<DialResponse, SignallingError> {
        let addr = self.server_addr;
        let wrap = |source| SignallingError::Exchange { addr, source };

        write_message(&mut self.stream, request).await.map_err(wrap)?;
        debug!(
            "sent dial request: my_id {}, peer_id {}, private_addr {}",
            request.my_id, request.peer_id, request.my_private_addr
        );

        let response: DialResponse = read_message(&mut self.stream, MAX_MESSAGE_LEN)
            .await
            .map_err(wrap)?;

        info!(
            "received peer info: id {}, public_addr {}, private_addr {}",
            response.peer_id, response.peer_public_addr, response.peer_private_addr
        );

        Ok(response)
    }
}
