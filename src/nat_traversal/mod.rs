/**
 * nat_traversal/mod.rs
 *
 * NAT traversal module implementing:
 * - control channel client for the rendezvous server
 * - reusable socket factory
 * - racing TCP simultaneous open
 */

mod address;
mod reusable_socket;
mod signalling;
mod tcp_connect;
mod types;

pub use address::{parse_endpoint, AddressError};
pub use reusable_socket::{bind_reusable, enable_reuse, listen_reusable, new_bound_socket, SocketError};
pub use signalling::{SignallingClient, SignallingError};
pub use tcp_connect::{accept_loop, punch_loop, PunchExit, PunchRace, Punched, WinnerSlot};
pub use types::{ConnectionState, DialConfig, PunchTarget, RetryPolicy};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::protocol::{DialRequest, DialResponse};

/// Dial phase, for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPhase {
    Handshake,
    Punch,
}

impl fmt::Display for DialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialPhase::Handshake => write!(f, "control channel handshake"),
            DialPhase::Punch => write!(f, "hole punching"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("rendezvous {server}: {source}")]
    Signalling {
        server: String,
        #[source]
        source: SignallingError,
    },

    #[error("control connection local address {addr} is unusable: {source}")]
    LocalAddress {
        addr: SocketAddr,
        #[source]
        source: AddressError,
    },

    #[error("timed out after {after:?} during {phase}")]
    Timeout { phase: DialPhase, after: Duration },

    #[error("no connection to peer {peer_id} (public {public}, private {private})")]
    Exhausted {
        peer_id: String,
        public: String,
        private: String,
    },
}

/// Hole punching dialer: register with the rendezvous server, learn the
/// peer's endpoints, then race direct connects from the control tuple.
pub struct HolePunchDialer {
    config: DialConfig,
    state: ConnectionState,
}

impl HolePunchDialer {
    pub fn new(config: DialConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
        }
    }

    /// Run the full pipeline and return the direct connection to the peer
    pub async fn dial(
        &mut self,
        rendezvous_addr: &str,
        request: DialRequest,
    ) -> Result<TcpStream, DialError> {
        match self.run(rendezvous_addr, request).await {
            Ok(stream) => {
                self.state = ConnectionState::Connected;
                Ok(stream)
            }
            Err(e) => {
                warn!("dial failed: {}", e);
                self.state = ConnectionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Get current connection state
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn run(&mut self, rendezvous_addr: &str, mut request: DialRequest) -> Result<TcpStream, DialError> {
        let signalling_err = |source| DialError::Signalling {
            server: rendezvous_addr.to_string(),
            source,
        };

        // Step 1: control connection, its local tuple is reused for punching
        self.state = ConnectionState::ConnectingRendezvous;
        let mut control = SignallingClient::connect(rendezvous_addr)
            .await
            .map_err(signalling_err)?;

        let local_addr = control.local_addr();
        let local = parse_endpoint(&local_addr.to_string()).map_err(|source| DialError::LocalAddress {
            addr: local_addr,
            source,
        })?;

        // Step 2: register and wait for the peer
        self.state = ConnectionState::AwaitingPeer;
        request.my_private_addr = local_addr.to_string();
        let response: DialResponse = bounded(
            DialPhase::Handshake,
            self.config.handshake_timeout,
            control.exchange(&request),
        )
        .await?
        .map_err(signalling_err)?;

        // Step 3: race both endpoints; the control connection stays open
        // until the race is decided so the NAT mapping stays alive
        self.state = ConnectionState::Punching;
        let race = PunchRace::start(
            local,
            &response.peer_public_addr,
            &response.peer_private_addr,
            &self.config.retry,
        );

        let punched = bounded(DialPhase::Punch, self.config.punch_timeout, race.winner())
            .await?
            .ok_or_else(|| DialError::Exhausted {
                peer_id: response.peer_id.clone(),
                public: response.peer_public_addr.clone(),
                private: response.peer_private_addr.clone(),
            })?;

        drop(control);

        info!(
            "connected to peer {} ({}): {:?} -> {:?}",
            response.peer_id,
            punched.target,
            punched.stream.local_addr().ok(),
            punched.stream.peer_addr().ok()
        );

        Ok(punched.stream)
    }
}

async fn bounded<F: Future>(phase: DialPhase, limit: Option<Duration>, fut: F) -> Result<F::Output, DialError> {
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| DialError::Timeout { phase, after }),
        None => Ok(fut.await),
    }
}
