//! Peer: acceptor, connector, and the set of live sessions
//!
//! The acceptor is opened dual-stack (IPv6 with `IPV6_V6ONLY` off and
//! `SO_REUSEADDR` set) so one listener serves both address families; hosts
//! without an IPv6 stack fall back to a plain IPv4 listener.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::session::Session;

const BACKLOG: i32 = 128;

type SessionMap = Mutex<HashMap<u64, Arc<Session>>>;

pub struct Peer {
    listener: TcpListener,
    sessions: Arc<SessionMap>,
    next_session_id: AtomicU64,
}

impl Peer {
    /// Open the acceptor on `port`. Port 0 selects an ephemeral port,
    /// reported by [`Peer::local_addr`].
    ///
    /// # Errors
    /// Propagates bind/listen failures.
    pub fn bind(port: u16) -> Result<Self, Error> {
        let listener = bind_dual_stack(port)?;
        info!(addr = %listener.local_addr()?, "peer listening");

        Ok(Self {
            listener,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session_id: AtomicU64::new(0),
        })
    }

    /// The acceptor's bound address.
    ///
    /// # Errors
    /// Propagates socket introspection failures.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and register a session for it.
    ///
    /// The session deregisters itself from this peer when it closes. The
    /// peer's map holds the owning reference; callers get a `Weak`.
    ///
    /// # Errors
    /// Propagates accept failures.
    pub async fn accept_one(&self) -> Result<Weak<Session>, Error> {
        let (stream, addr) = self.listener.accept().await?;
        debug!(%addr, "accepted connection");
        Ok(Arc::downgrade(&self.register(stream)))
    }

    /// Accept connections repeatedly, invoking `on_accept` per session.
    ///
    /// Re-arms itself after every accepted connection; the first accept
    /// error terminates the loop and is returned, leaving re-arm policy to
    /// the caller.
    ///
    /// # Errors
    /// The accept failure that ended the loop.
    pub async fn accept_loop<F>(&self, mut on_accept: F) -> Result<(), Error>
    where
        F: FnMut(Weak<Session>),
    {
        loop {
            let session = self.accept_one().await?;
            on_accept(session);
        }
    }

    /// Resolve `host` and connect to the first endpoint that accepts,
    /// registering a session for the connection.
    ///
    /// # Errors
    /// [`Error::ConnectFailed`] when resolution fails or every endpoint
    /// refuses.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Weak<Session>, Error> {
        let addrs = lookup_host((host, port))
            .await
            .map_err(|e| Error::ConnectFailed {
                host: host.to_owned(),
                port,
                source: e,
            })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(%addr, "connected");
                    return Ok(Arc::downgrade(&self.register(stream)));
                }
                Err(e) => {
                    debug!(%addr, error = %e, "endpoint refused connection");
                    last_err = Some(e);
                }
            }
        }

        Err(Error::ConnectFailed {
            host: host.to_owned(),
            port,
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")),
        })
    }

    /// Close every live session and empty the set.
    ///
    /// Closing a session removes it from the map via its on-close callback,
    /// so the map is drained into a snapshot first and the removals hit an
    /// already-empty map.
    pub fn clear_sessions(&self) {
        let snapshot: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            sessions.drain().map(|(_, session)| session).collect()
        };

        for session in snapshot {
            session.close();
        }
    }

    /// Number of live registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .len()
    }

    fn register(&self, stream: TcpStream) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        // The session holds only a weak handle on the map, so the
        // map→session→map cycle never outlives close().
        let map = Arc::downgrade(&self.sessions);
        let session = Session::new(
            stream,
            Some(Box::new(move || {
                if let Some(map) = map.upgrade() {
                    map.lock().expect("session map lock poisoned").remove(&id);
                }
            })),
        );

        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .insert(id, Arc::clone(&session));
        session
    }
}

fn bind_dual_stack(port: u16) -> Result<TcpListener, Error> {
    match bind_v6(port) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            warn!(error = %e, "dual-stack bind failed, falling back to IPv4");
            Ok(bind_listener(
                Domain::IPV4,
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            )?)
        }
    }
}

fn bind_v6(port: u16) -> io::Result<TcpListener> {
    bind_listener(
        Domain::IPV6,
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
    )
}

fn bind_listener(domain: Domain, addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if domain == Domain::IPV6 {
        // One listener for both address families.
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accept_and_connect_register_sessions() {
        let server = Peer::bind(0).unwrap();
        let port = server.local_addr().unwrap().port();
        let client = Peer::bind(0).unwrap();

        let (accepted, connected) =
            tokio::join!(server.accept_one(), client.connect("127.0.0.1", port));

        assert!(accepted.unwrap().upgrade().is_some());
        assert!(connected.unwrap().upgrade().is_some());
        assert_eq!(server.session_count(), 1);
        assert_eq!(client.session_count(), 1);
    }

    #[tokio::test]
    async fn test_session_close_deregisters() {
        let server = Peer::bind(0).unwrap();
        let port = server.local_addr().unwrap().port();
        let client = Peer::bind(0).unwrap();

        let (accepted, connected) =
            tokio::join!(server.accept_one(), client.connect("127.0.0.1", port));
        let accepted = accepted.unwrap();
        let _connected = connected.unwrap();

        let session = accepted.upgrade().unwrap();
        session.close();
        drop(session);

        assert_eq!(server.session_count(), 0);
        // The peer's map held the owning reference.
        assert!(accepted.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_clear_sessions_closes_everything() {
        let server = Peer::bind(0).unwrap();
        let port = server.local_addr().unwrap().port();
        let client = Peer::bind(0).unwrap();

        for _ in 0..3 {
            let (accepted, connected) =
                tokio::join!(server.accept_one(), client.connect("127.0.0.1", port));
            accepted.unwrap();
            connected.unwrap();
        }
        assert_eq!(client.session_count(), 3);

        let weak = {
            let (accepted, connected) =
                tokio::join!(server.accept_one(), client.connect("127.0.0.1", port));
            accepted.unwrap();
            connected.unwrap()
        };
        let held = weak.upgrade().unwrap();

        client.clear_sessions();
        assert_eq!(client.session_count(), 0);
        assert!(held.is_closed());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let client = Peer::bind(0).unwrap();

        // A freshly bound-and-dropped port refuses connections.
        let dead_port = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let err = client.connect("127.0.0.1", dead_port).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { .. }));
        assert_eq!(client.session_count(), 0);
    }

    #[tokio::test]
    async fn test_accept_loop_rearms() {
        let server = Arc::new(Peer::bind(0).unwrap());
        let port = server.local_addr().unwrap().port();

        let acceptor = Arc::clone(&server);
        let accepted = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            let _ = acceptor
                .accept_loop(|_session| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        });

        let client = Peer::bind(0).unwrap();
        for _ in 0..3 {
            client.connect("127.0.0.1", port).await.unwrap();
        }

        // Give the loop a moment to drain the backlog.
        for _ in 0..50 {
            if accepted.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        task.abort();
    }
}
