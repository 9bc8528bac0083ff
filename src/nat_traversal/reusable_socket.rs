/**
 * nat_traversal/reusable_socket.rs
 *
 * TCP sockets bound to a fixed local address:port with SO_REUSEADDR/SO_REUSEPORT
 */

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use super::address::{parse_endpoint, AddressError};

const LISTEN_BACKLOG: u32 = 1024;

/// Socket factory errors
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket creation failed: {0}")]
    SocketCreateFailed(#[source] io::Error),

    #[error("setting {option} failed: {source}")]
    SetOptionFailed {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid local address: {0}")]
    AddressParseFailed(#[from] AddressError),

    #[error("bind to {addr} failed: {source}")]
    BindFailed {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("listen on {addr} failed: {source}")]
    ListenFailed {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    /// The local address:port is already taken in a way retrying cannot fix
    pub fn is_local_conflict(&self) -> bool {
        match self {
            SocketError::BindFailed { source, .. } | SocketError::ListenFailed { source, .. } => {
                is_conflict(source)
            }
            _ => false,
        }
    }
}

/// `AddrInUse` on bind, or a 4-tuple already in use on connect
/// (reported as `AddrNotAvailable` on Linux).
pub(crate) fn is_conflict(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable
    )
}

/// Create an unconnected TCP socket bound to `local_addr` ("ip:port") with
/// address and port reuse enabled.
///
/// The socket is closed when dropped, so an unused handle never leaks.
pub fn new_bound_socket(local_addr: &str) -> Result<TcpSocket, SocketError> {
    let addr = parse_endpoint(local_addr)?;
    bind_reusable(addr)
}

/// Same as [`new_bound_socket`] for an already parsed address.
pub fn bind_reusable(addr: SocketAddrV4) -> Result<TcpSocket, SocketError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(SocketError::SocketCreateFailed)?;

    set_reuse(&socket)?;

    // Bind to the exact tuple, never the wildcard
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|source| SocketError::BindFailed { addr, source })?;

    socket
        .set_nonblocking(true)
        .map_err(|source| SocketError::SetOptionFailed {
            option: "O_NONBLOCK",
            source,
        })?;

    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpSocket::from_std_stream(std_stream))
}

/// Listen on `addr` with reuse enabled, sharing the tuple with the outbound
/// attempts bound to it.
pub fn listen_reusable(addr: SocketAddrV4) -> Result<TcpListener, SocketError> {
    bind_reusable(addr)?
        .listen(LISTEN_BACKLOG)
        .map_err(|source| SocketError::ListenFailed { addr, source })
}

/// Enable reuse on an already connected stream (the control connection) so
/// its local tuple can be bound again by the punch attempts.
pub fn enable_reuse(stream: &TcpStream) -> Result<(), SocketError> {
    let sock = SockRef::from(stream);
    set_reuse(&sock)
}

fn set_reuse(socket: &Socket) -> Result<(), SocketError> {
    socket
        .set_reuse_address(true)
        .map_err(|source| SocketError::SetOptionFailed {
            option: "SO_REUSEADDR",
            source,
        })?;

    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|source| SocketError::SetOptionFailed {
            option: "SO_REUSEPORT",
            source,
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn binds_exact_local_address() {
        let socket = new_bound_socket("127.0.0.1:0").unwrap();
        let local = socket.local_addr().unwrap();
        assert_eq!(local.ip().to_string(), "127.0.0.1");
        assert_ne!(local.port(), 0);
    }

    #[tokio::test]
    async fn two_sockets_share_one_tuple() {
        let first = new_bound_socket("127.0.0.1:0").unwrap();
        let local = first.local_addr().unwrap().to_string();

        let second = new_bound_socket(&local).unwrap();
        assert_eq!(second.local_addr().unwrap().to_string(), local);
    }

    #[tokio::test]
    async fn rebinds_tuple_of_connected_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let control = TcpStream::connect(target).await.unwrap();
        enable_reuse(&control).unwrap();
        let local = control.local_addr().unwrap().to_string();

        // Second listener so the rebound socket has somewhere distinct to go
        let other = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let other_addr = other.local_addr().unwrap();

        let socket = new_bound_socket(&local).unwrap();
        let mut stream = socket.connect(other_addr).await.unwrap();
        let (mut accepted, from) = other.accept().await.unwrap();
        assert_eq!(from.to_string(), local);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn listens_on_tuple_of_connected_stream() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        enable_reuse(&control).unwrap();
        let local = match control.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            other => panic!("unexpected {other}"),
        };

        let listener = listen_reusable(local).unwrap();
        assert_eq!(listener.local_addr().unwrap(), SocketAddr::V4(local));

        let mut dialer = TcpStream::connect(local).await.unwrap();
        let (mut accepted, from) = listener.accept().await.unwrap();
        assert_eq!(from, dialer.local_addr().unwrap());

        dialer.write_all(b"knock").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"knock");
    }

    #[tokio::test]
    async fn rejects_unparseable_local_address() {
        let err = new_bound_socket("not-an-address").unwrap_err();
        assert!(matches!(err, SocketError::AddressParseFailed(_)));
        assert!(!err.is_local_conflict());
    }

    #[tokio::test]
    async fn bind_conflict_is_local_conflict() {
        // std listener has no reuse flags, so the tuple is exclusively held
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let local = holder.local_addr().unwrap().to_string();

        let err = new_bound_socket(&local).unwrap_err();
        assert!(matches!(err, SocketError::BindFailed { .. }));
        assert!(err.is_local_conflict());
    }
}
