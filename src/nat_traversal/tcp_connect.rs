/**
 * nat_traversal/tcp_connect.rs
 *
 * TCP simultaneous open: racing connect loops towards the peer's public and
 * private endpoints, plus a listener, all on the same local address:port
 */

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::address::parse_endpoint;
use super::reusable_socket::{bind_reusable, is_conflict, listen_reusable};
use super::types::{PunchTarget, RetryPolicy};

/// A connection that won the race
#[derive(Debug)]
pub struct Punched {
    pub target: PunchTarget,
    pub stream: TcpStream,
}

/// Why an attempt loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchExit {
    /// Published the winning connection
    Won,
    /// Connected, but the other loop had already won; socket closed
    Lost,
    /// Address already in use on the local tuple, or the 4-tuple towards
    /// the target is already taken
    LocalConflict,
    /// Target endpoint did not parse
    InvalidTarget,
    /// Retry budget used up
    AttemptsExhausted,
    /// Slot already taken before this loop connected
    Cancelled,
}

/// Single-slot result channel shared by the attempt loops.
///
/// Only the first publish is accepted; later ones get their stream back so
/// the caller closes it.
pub struct WinnerSlot {
    tx: Mutex<Option<oneshot::Sender<Punched>>>,
}

impl WinnerSlot {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Punched>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Try to publish; returns the connection if the slot was already taken
    /// or nobody is waiting anymore.
    pub fn publish(&self, punched: Punched) -> Result<(), Punched> {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match tx {
            Some(tx) => tx.send(punched),
            None => Err(punched),
        }
    }

    pub fn is_taken(&self) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

/// Run one attempt loop: bind a fresh socket to `local`, connect to
/// `target`, repeat until connected or told to stop.
pub async fn punch_loop(
    which: PunchTarget,
    local: SocketAddrV4,
    target: String,
    retry: RetryPolicy,
    slot: Arc<WinnerSlot>,
) -> PunchExit {
    let target_addr = match parse_endpoint(&target) {
        Ok(addr) => addr,
        Err(e) => {
            warn!("invalid peer address {} ({}): {}", target, which, e);
            return PunchExit::InvalidTarget;
        }
    };

    let mut attempts: u32 = 0;

    loop {
        if slot.is_taken() {
            return PunchExit::Cancelled;
        }

        if retry.max_attempts.is_some_and(|max| attempts >= max) {
            warn!("giving up on {} ({}) after {} attempts", target_addr, which, attempts);
            return PunchExit::AttemptsExhausted;
        }
        attempts += 1;

        let socket = match bind_reusable(local) {
            Ok(socket) => socket,
            Err(e) if e.is_local_conflict() => {
                warn!("local tuple {} unavailable ({}): {}", local, which, e);
                return PunchExit::LocalConflict;
            }
            Err(e) => {
                debug!("failed creating reusable socket ({}): {}", which, e);
                pause(&retry).await;
                continue;
            }
        };

        // The socket is consumed by connect and closed on failure
        match socket.connect(SocketAddr::V4(target_addr)).await {
            Ok(stream) => {
                return match slot.publish(Punched { target: which, stream }) {
                    Ok(()) => {
                        info!("dialed new connection to peer ({}): {} -> {}", which, local, target_addr);
                        PunchExit::Won
                    }
                    Err(lost) => {
                        debug!("closing late connection to {} ({})", target_addr, which);
                        drop(lost.stream);
                        PunchExit::Lost
                    }
                };
            }
            Err(e) if is_conflict(&e) => {
                warn!("raw connect to peer {} ({}): {}, stopping", target_addr, which, e);
                return PunchExit::LocalConflict;
            }
            Err(e) => {
                debug!("raw connect to peer {} ({}): {}", target_addr, which, e);
                pause(&retry).await;
            }
        }
    }
}

async fn pause(retry: &RetryPolicy) {
    if retry.interval.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(retry.interval).await;
    }
}

/// Accept on `local` and publish the first inbound connection.
///
/// When the peer's SYN reaches us before our own connect is in flight, the
/// kernel would otherwise answer it with a reset; the listener turns that
/// SYN into the connection instead.
pub async fn accept_loop(local: SocketAddrV4, retry: RetryPolicy, slot: Arc<WinnerSlot>) -> PunchExit {
    let listener = match listen_reusable(local) {
        Ok(listener) => listener,
        Err(e) => {
            warn!("cannot listen on {}: {}", local, e);
            return PunchExit::LocalConflict;
        }
    };
    debug!("listening for peer on {}", local);

    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                return match slot.publish(Punched {
                    target: PunchTarget::Inbound,
                    stream,
                }) {
                    Ok(()) => {
                        info!("accepted new connection from peer: {} -> {}", from, local);
                        PunchExit::Won
                    }
                    Err(lost) => {
                        debug!("closing late inbound connection from {}", from);
                        drop(lost.stream);
                        PunchExit::Lost
                    }
                };
            }
            Err(e) => {
                debug!("accept on {}: {}", local, e);
                pause(&retry).await;
            }
        }
    }
}

/// The contributors of one dial: a connect loop per peer endpoint and a
/// listener on the shared local tuple.
///
/// Dropping a `PunchRace` aborts anything still running, which closes its
/// in-flight socket.
pub struct PunchRace {
    loops: JoinSet<PunchExit>,
    acceptor: JoinSet<PunchExit>,
    winner: oneshot::Receiver<Punched>,
}

impl PunchRace {
    /// Spawn one loop per target and the listener, all bound to `local`
    pub fn start(local: SocketAddrV4, public: &str, private: &str, retry: &RetryPolicy) -> Self {
        let (slot, winner) = WinnerSlot::new();
        let mut loops = JoinSet::new();
        let mut acceptor = JoinSet::new();

        acceptor.spawn(accept_loop(local, retry.clone(), Arc::clone(&slot)));

        for (which, target) in [(PunchTarget::Public, public), (PunchTarget::Private, private)] {
            loops.spawn(punch_loop(
                which,
                local,
                target.to_string(),
                retry.clone(),
                Arc::clone(&slot),
            ));
        }

        Self {
            loops,
            acceptor,
            winner,
        }
    }

    /// Wait for the first connection. `None` means no contributor can
    /// produce one anymore.
    ///
    /// Once the connect loops are gone the listener alone keeps the race
    /// open, but only if a loop stopped on a taken 4-tuple: that is what a
    /// connection sitting in the listener's accept queue looks like from the
    /// connect side.
    pub async fn winner(mut self) -> Option<Punched> {
        let mut tuple_taken = false;
        let mut loops_done = false;

        let punched = loop {
            tokio::select! {
                biased;

                punched = &mut self.winner => break punched.ok(),

                joined = self.loops.join_next(), if !loops_done => match joined {
                    Some(Ok(PunchExit::LocalConflict)) => tuple_taken = true,
                    Some(_) => {}
                    None => {
                        loops_done = true;
                        if !tuple_taken {
                            break self.winner.try_recv().ok();
                        }
                    }
                },
            }
        };

        self.loops.abort_all();
        self.acceptor.abort_all();
        punched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_traversal::reusable_socket::new_bound_socket;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn local_tuple() -> (tokio::net::TcpSocket, SocketAddrV4) {
        let anchor = new_bound_socket("127.0.0.1:0").unwrap();
        let local = match anchor.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            other => panic!("unexpected {other}"),
        };
        (anchor, local)
    }

    #[tokio::test]
    async fn slot_accepts_only_first_publish() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).await.unwrap();
        let b = TcpStream::connect(addr).await.unwrap();

        let (slot, rx) = WinnerSlot::new();
        assert!(!slot.is_taken());
        slot.publish(Punched { target: PunchTarget::Public, stream: a }).unwrap();
        assert!(slot.is_taken());

        let rejected = slot
            .publish(Punched { target: PunchTarget::Private, stream: b })
            .unwrap_err();
        assert_eq!(rejected.target, PunchTarget::Private);

        assert_eq!(rx.await.unwrap().target, PunchTarget::Public);
    }

    #[tokio::test]
    async fn invalid_target_stops_loop() {
        let (_anchor, local) = local_tuple();
        let (slot, rx) = WinnerSlot::new();

        let exit = punch_loop(
            PunchTarget::Private,
            local,
            "[::1]:4000".into(),
            RetryPolicy::default(),
            slot,
        )
        .await;

        assert_eq!(exit, PunchExit::InvalidTarget);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn local_conflict_stops_without_result() {
        // Exclusive holder of the tuple: bind must fail with AddrInUse
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let local = match holder.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            other => panic!("unexpected {other}"),
        };
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (slot, rx) = WinnerSlot::new();
        let exit = timeout(
            Duration::from_secs(5),
            punch_loop(
                PunchTarget::Public,
                local,
                target.local_addr().unwrap().to_string(),
                RetryPolicy::default(),
                slot,
            ),
        )
        .await
        .unwrap();

        assert_eq!(exit, PunchExit::LocalConflict);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn bounded_retries_give_up() {
        let (_anchor, local) = local_tuple();
        // Nothing listens here, every connect is refused
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };

        let (slot, rx) = WinnerSlot::new();
        let retry = RetryPolicy {
            interval: Duration::from_millis(1),
            max_attempts: Some(3),
        };
        let exit = punch_loop(PunchTarget::Public, local, closed.to_string(), retry, slot).await;

        assert_eq!(exit, PunchExit::AttemptsExhausted);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn loser_connection_is_closed() {
        let (_anchor, local) = local_tuple();
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let first_addr = first.local_addr().unwrap();
        let second_addr = second.local_addr().unwrap();

        let race = PunchRace::start(
            local,
            &first_addr.to_string(),
            &second_addr.to_string(),
            &RetryPolicy::default(),
        );
        let mut won = timeout(Duration::from_secs(5), race.winner())
            .await
            .unwrap()
            .expect("one loop should connect");

        let (winner_listener, loser_listener) = match won.target {
            PunchTarget::Public => (first, second),
            PunchTarget::Private => (second, first),
            PunchTarget::Inbound => panic!("nothing dials the local tuple here"),
        };
        assert_eq!(
            won.stream.peer_addr().unwrap(),
            winner_listener.local_addr().unwrap()
        );

        // The winner carries data end to end
        let (mut accepted, from) = winner_listener.accept().await.unwrap();
        assert_eq!(SocketAddr::V4(local), from);
        won.stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Whatever reached the other listener has been closed by us
        if let Ok(Ok((mut stale, _))) =
            timeout(Duration::from_millis(500), loser_listener.accept()).await
        {
            let mut byte = [0u8; 1];
            let read = timeout(Duration::from_secs(5), stale.read(&mut byte))
                .await
                .unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }
    }

    #[tokio::test]
    async fn taken_four_tuple_stops_loop() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();

        // Established connection already owns local -> target
        let (anchor, local) = local_tuple();
        let _established = anchor.connect(target_addr).await.unwrap();

        let (slot, rx) = WinnerSlot::new();
        let exit = timeout(
            Duration::from_secs(5),
            punch_loop(
                PunchTarget::Public,
                local,
                target_addr.to_string(),
                RetryPolicy::default(),
                slot,
            ),
        )
        .await
        .unwrap();

        assert_eq!(exit, PunchExit::LocalConflict);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn accept_loop_publishes_inbound_connection() {
        let (_anchor, local) = local_tuple();
        let (slot, rx) = WinnerSlot::new();
        let acceptor = tokio::spawn(accept_loop(local, RetryPolicy::default(), slot));

        let mut dialer = loop {
            match TcpStream::connect(local).await {
                Ok(stream) => break stream,
                Err(_) => tokio::task::yield_now().await,
            }
        };

        let mut won = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(won.target, PunchTarget::Inbound);
        assert_eq!(won.stream.peer_addr().unwrap(), dialer.local_addr().unwrap());
        assert_eq!(acceptor.await.unwrap(), PunchExit::Won);

        dialer.write_all(b"syn").await.unwrap();
        let mut buf = [0u8; 3];
        won.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"syn");
    }

    #[tokio::test]
    async fn race_wins_through_listener_when_targets_refuse() {
        let (_anchor, local) = local_tuple();
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };

        let retry = RetryPolicy {
            interval: Duration::from_millis(5),
            max_attempts: None,
        };
        let race = PunchRace::start(local, &closed, &closed, &retry);

        let (_dialer, won) = tokio::join!(
            async {
                loop {
                    match TcpStream::connect(local).await {
                        Ok(stream) => break stream,
                        Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                    }
                }
            },
            timeout(Duration::from_secs(5), race.winner())
        );

        let won = won.unwrap().expect("listener should win");
        assert_eq!(won.target, PunchTarget::Inbound);
    }

    #[tokio::test]
    async fn two_races_meet_on_a_single_thread() {
        let (_anchor_a, a) = local_tuple();
        let (_anchor_b, b) = local_tuple();
        let retry = RetryPolicy::default();

        let race_a = PunchRace::start(a, &b.to_string(), &b.to_string(), &retry);
        let race_b = PunchRace::start(b, &a.to_string(), &a.to_string(), &retry);

        let (won_a, won_b) = timeout(
            Duration::from_secs(10),
            async { tokio::join!(race_a.winner(), race_b.winner()) },
        )
        .await
        .unwrap();
        let mut won_a = won_a.expect("a connected");
        let mut won_b = won_b.expect("b connected");

        assert_eq!(won_a.stream.local_addr().unwrap(), SocketAddr::V4(a));
        assert_eq!(won_a.stream.peer_addr().unwrap(), SocketAddr::V4(b));
        assert_eq!(won_b.stream.peer_addr().unwrap(), SocketAddr::V4(a));

        won_a.stream.write_all(b"ab").await.unwrap();
        let mut buf = [0u8; 2];
        won_b.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
    }
}
