/**
 * rendezvous/mod.rs
 *
 * Rendezvous server: pairs two registrations with complementary ids and
 * hands each side the other's public and private address
 */

mod table;

pub use table::{ControlHandle, EndpointMapping, PairingTable, Registration};

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::protocol::{read_message, write_message, DialRequest, DialResponse, ProtocolError, MAX_MESSAGE_LEN};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Rendezvous server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Bound on receiving the registration after accept
    pub read_timeout: Option<Duration>,

    /// Bound on waiting for the counterpart to register
    pub peer_wait_timeout: Option<Duration>,

    pub max_message_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_secs(30)),
            peer_wait_timeout: None,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("control channel: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("timed out after {after:?} while {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        after: Duration,
    },

    #[error("registration for {0} was replaced by a newer one")]
    Superseded(String),

    #[error("peer {0} disconnected before its addresses could be delivered")]
    PeerGone(String),

    #[error("client {0} disconnected while waiting for its peer")]
    ClientGone(String),
}

/// Rendezvous server state shared by every connection handler
#[derive(Debug, Default)]
pub struct RendezvousServer {
    table: PairingTable,
    config: ServerConfig,
}

impl RendezvousServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            table: PairingTable::new(),
            config,
        }
    }

    pub fn table(&self) -> &PairingTable {
        &self.table
    }

    /// Accept control connections forever, one task per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!("listening on {}", listener.local_addr()?);

        loop {
            let (conn, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Descriptor exhaustion clears only as connections close
                    error!("failed to accept control connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(conn).await {
                    warn!("control connection from {} failed: {}", remote, e);
                }
            });
        }
    }

    /// Serve one control connection through registration, pairing and
    /// response delivery. The connection is closed when this returns.
    pub async fn handle_connection(&self, conn: TcpStream) -> Result<(), ServerError> {
        let public_addr = conn.peer_addr()?;
        self.handle_control(conn, public_addr).await
    }

    /// Same as [`handle_connection`](Self::handle_connection) for any byte
    /// stream whose transport-observed remote address is `public_addr`.
    pub async fn handle_control<S>(&self, mut conn: S, public_addr: SocketAddr) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request: DialRequest = bounded(
            "the dial request",
            self.config.read_timeout,
            read_message(&mut conn, self.config.max_message_len),
        )
        .await??;

        info!(
            "new dial request: to {}, from {}, private_addr {}, public_addr {}",
            request.peer_id, request.my_id, request.my_private_addr, public_addr
        );

        let (mapping, delivery) = EndpointMapping::new(&request, public_addr.to_string());
        let registration = mapping.registration();

        match self.table.register(mapping).await {
            Registration::Paired { mine, peer } => {
                info!(
                    "paired {} ({}) with {} ({})",
                    mine.id, mine.public_addr, peer.id, peer.public_addr
                );
                let to_me = peer.describe();
                let to_peer = mine.describe();

                let sent = write_message(&mut conn, &to_me).await;
                let delivered = peer
                    .into_control()
                    .deliver(to_peer)
                    .map_err(|_| ServerError::PeerGone(request.peer_id.clone()));

                sent?;
                delivered
            }
            Registration::Waiting { displaced } => {
                // Dropping the old mapping tells its handler it was superseded
                if let Some(old) = displaced {
                    debug!("replaced registration {} for {}", old.registration(), old.id);
                }

                let response = self
                    .await_peer(&mut conn, &request, registration, delivery)
                    .await?;
                write_message(&mut conn, &response).await?;
                debug!("delivered {} to {}", response.peer_id, request.my_id);
                Ok(())
            }
        }
    }

    /// Block until a counterpart completes the pairing, the client hangs up,
    /// or the peer wait bound expires.
    async fn await_peer<S>(
        &self,
        conn: &mut S,
        request: &DialRequest,
        registration: u64,
        mut delivery: oneshot::Receiver<DialResponse>,
    ) -> Result<DialResponse, ServerError>
    where
        S: AsyncRead + Unpin,
    {
        let waited = bounded(
            "the peer to register",
            self.config.peer_wait_timeout,
            async {
                let mut probe = [0u8; 64];
                loop {
                    tokio::select! {
                        response = &mut delivery => {
                            return response.map_err(|_| ServerError::Superseded(request.my_id.clone()));
                        }
                        read = conn.read(&mut probe) => match read {
                            Ok(0) | Err(_) => return Err(ServerError::ClientGone(request.my_id.clone())),
                            // Nothing else is expected on the control channel
                            Ok(_) => continue,
                        },
                    }
                }
            },
        )
        .await;

        match waited {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.table.remove_registration(&request.my_id, registration).await;
                Err(e)
            }
            Err(timeout) => {
                if self.table.remove_registration(&request.my_id, registration).await {
                    return Err(timeout);
                }
                // Claimed by a counterpart just as the bound expired
                delivery
                    .await
                    .map_err(|_| ServerError::Superseded(request.my_id.clone()))
            }
        }
    }
}

async fn bounded<F: Future>(waiting_for: &'static str, limit: Option<Duration>, fut: F) -> Result<F::Output, ServerError> {
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| ServerError::Timeout { waiting_for, after }),
        None => Ok(fut.await),
    }
}
