//! TCP accept server: an accept-loop fiber plus one handler fiber per
//! connection.
//!
//! The server binds a listening socket on one reactor (the accept reactor)
//! and spreads accepted connections across the pool round-robin. Each
//! connection gets a [`ConnectionHandler`] built by a user-supplied factory
//! *on the connection's reactor*, then runs as its own fiber.
//!
//! Shutdown, triggered by SIGINT/SIGTERM or [`AcceptServer::stop`], closes
//! the acceptor (breaking the accept loop), cancels every live connection
//! (waking each handler fiber with an error), waits for the live set to
//! drain, and finally signals "fully stopped". Handlers unlink themselves
//! from the live set via a closure posted to the accept reactor, so the set
//! is only ever mutated there.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fibers::{Condvar, Done, Mutex as FiberMutex};
use crate::reactor::pool::{ReactorPool, ReactorRouter};
use crate::reactor::{NiceLevel, ReactorContext, ReactorHandle};

/// Listen backlog for the accept socket.
pub const ACCEPT_BACKLOG: u32 = 64;

// =============================================================================
// Connection handler contract
// =============================================================================

/// Per-connection protocol logic.
///
/// A handler is built by the server's factory on the reactor that will run
/// the connection, then driven as a fiber. When the handler returns, or
/// when server shutdown cancels the connection, the fiber unlinks itself
/// and ends.
pub trait ConnectionHandler: Send + 'static {
    /// Drives the connection to completion. Returning `Ok` means the peer
    /// finished cleanly; errors are logged by the server.
    fn run<'a>(
        &'a mut self,
        conn: &'a mut Connection,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + 'a>>;
}

/// Builds a handler for a freshly accepted connection, on its reactor.
pub type HandlerFactory = Arc<dyn Fn(&ReactorContext) -> Box<dyn ConnectionHandler> + Send + Sync>;

/// An accepted connection, owned by its handler fiber.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
}

impl Connection {
    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether server shutdown has been requested for this connection.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Reads from the socket, failing with `ConnectionAborted` once the
    /// server starts shutting down.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            res = self.stream.read(buf) => res,
            _ = self.shutdown.cancelled() => Err(shutdown_error()),
        }
    }

    /// Writes the whole buffer, failing with `ConnectionAborted` once the
    /// server starts shutting down.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        tokio::select! {
            res = self.stream.write_all(buf) => res,
            _ = self.shutdown.cancelled() => Err(shutdown_error()),
        }
    }

    /// Direct access to the underlying stream for protocols that need more
    /// than the read/write helpers. Such code must watch
    /// [`Connection::is_shutting_down`] itself.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

fn shutdown_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "server shutting down")
}

// =============================================================================
// Server
// =============================================================================

/// Configuration for [`AcceptServer::bind`].
#[derive(Clone, Debug)]
pub struct AcceptServerConfig {
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,

    /// Listen backlog.
    pub backlog: u32,

    /// Register SIGINT/SIGTERM handlers that trigger graceful shutdown.
    /// Disable in test harnesses that manage signals themselves.
    pub handle_signals: bool,
}

impl Default for AcceptServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            backlog: ACCEPT_BACKLOG,
            handle_signals: true,
        }
    }
}

impl AcceptServerConfig {
    /// Configuration listening on `port` with defaults otherwise.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

/// State shared between the accept loop, handler fibers, and the public
/// server handle.
struct ServerShared {
    /// Live connections: id -> per-connection cancellation token. Mutated
    /// only on the accept reactor.
    connections: FiberMutex<HashMap<u64, CancellationToken>>,
    /// Signalled when the live set drains to empty.
    empty_cv: Condvar,
    /// Server-wide shutdown token; connection tokens are children of it.
    stop_token: CancellationToken,
    /// Set once the drain has completed.
    done: Done,
}

/// A TCP accept server over a [`ReactorPool`].
///
/// Lifecycle: [`AcceptServer::bind`], [`AcceptServer::run`], then
/// [`AcceptServer::stop`] (or a signal) and [`AcceptServer::wait`]. The
/// server must be fully stopped before its pool is.
pub struct AcceptServer {
    reactor: ReactorHandle,
    router: ReactorRouter,
    factory: HandlerFactory,
    listener: StdMutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    config: AcceptServerConfig,
    was_run: AtomicBool,
}

impl AcceptServer {
    /// Binds the listening socket (with `SO_REUSEADDR`) on one of the pool's
    /// reactors. The accept loop does not start until [`AcceptServer::run`].
    pub fn bind(
        config: AcceptServerConfig,
        pool: &ReactorPool,
        factory: HandlerFactory,
    ) -> io::Result<Self> {
        let reactor = pool.next_context();
        let router = pool.router();

        // Socket setup must happen on the accept reactor: tokio registers
        // the listener with that reactor's I/O driver at creation.
        let done = Done::new();
        let slot: Arc<StdMutex<Option<io::Result<TcpListener>>>> = Arc::new(StdMutex::new(None));
        {
            let done = done.clone();
            let slot = Arc::clone(&slot);
            let port = config.port;
            let backlog = config.backlog;
            reactor.post(move || {
                let result = bind_listener(port, backlog);
                *slot.lock().expect("bind slot poisoned") = Some(result);
                done.notify();
            });
        }
        done.wait_blocking();
        let listener = slot
            .lock()
            .expect("bind slot poisoned")
            .take()
            .expect("bind closure ran")?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "accept server listening");

        Ok(Self {
            reactor,
            router,
            factory,
            listener: StdMutex::new(Some(listener)),
            local_addr,
            shared: Arc::new(ServerShared {
                connections: FiberMutex::new(HashMap::new()),
                empty_cv: Condvar::new(),
                stop_token: CancellationToken::new(),
                done: Done::new(),
            }),
            config,
            was_run: AtomicBool::new(false),
        })
    }

    /// The bound address (useful with an ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Posts the accept-loop fiber onto the accept reactor and, if
    /// configured, the signal-watch fiber. Calling it again is a no-op.
    pub fn run(&self) {
        if self.was_run.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self
            .listener
            .lock()
            .expect("listener slot poisoned")
            .take()
            .expect("listener taken twice");

        #[cfg(unix)]
        if self.config.handle_signals {
            let stop = self.shared.stop_token.clone();
            self.reactor
                .spawn_fn(NiceLevel::NORMAL, move || watch_signals(stop));
        }

        let router = self.router.clone();
        let factory = Arc::clone(&self.factory);
        let shared = Arc::clone(&self.shared);
        self.reactor.spawn_fn(NiceLevel::NORMAL, move || {
            accept_loop(listener, router, factory, shared)
        });
    }

    /// Programmatic shutdown: closes the acceptor and cancels every live
    /// connection, exactly as SIGINT/SIGTERM would.
    pub fn stop(&self) {
        self.shared.stop_token.cancel();
    }

    /// Suspends the calling fiber until the server has fully stopped: accept
    /// loop exited and every handler fiber returned.
    pub async fn wait(&self) {
        if !self.was_run.load(Ordering::SeqCst) {
            return;
        }
        self.shared.done.wait().await;
    }

    /// Blocking variant of [`AcceptServer::wait`] for OS threads.
    pub fn wait_blocking(&self) {
        if !self.was_run.load(Ordering::SeqCst) {
            return;
        }
        self.shared.done.wait_blocking();
    }
}

impl std::fmt::Debug for AcceptServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptServer")
            .field("local_addr", &self.local_addr)
            .field("was_run", &self.was_run.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn bind_listener(port: u16, backlog: u32) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::UNSPECIFIED,
        port,
    )))?;
    socket.listen(backlog)
}

#[cfg(unix)]
async fn watch_signals(stop: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt());
    let sigterm = signal(SignalKind::terminate());
    let (mut sigint, mut sigterm) = match (sigint, sigterm) {
        (Ok(i), Ok(t)) => (i, t),
        _ => {
            warn!("failed to register signal handlers; relying on stop()");
            return;
        }
    };
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received; stopping accept server"),
        _ = sigterm.recv() => info!("SIGTERM received; stopping accept server"),
        _ = stop.cancelled() => return,
    }
    stop.cancel();
}

/// The accept loop. Runs as a fiber on the accept reactor.
async fn accept_loop(
    listener: TcpListener,
    router: ReactorRouter,
    factory: HandlerFactory,
    shared: Arc<ServerShared>,
) {
    let accept_reactor = ReactorContext::current().handle();
    let mut next_conn_id: u64 = 0;

    let result: io::Result<()> = async {
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shared.stop_token.cancelled() => return Ok(()),
            };
            // Any accept error breaks the loop; the drain below still runs.
            let (stream, peer) = accepted?;
            debug!(%peer, "accepted connection");

            let id = next_conn_id;
            next_conn_id += 1;
            let conn_token = shared.stop_token.child_token();
            shared
                .connections
                .lock()
                .await
                .insert(id, conn_token.clone());

            let target = router.next_context();
            let factory = Arc::clone(&factory);
            let shared = Arc::clone(&shared);
            let accept_reactor = accept_reactor.clone();
            target.spawn_fn(NiceLevel::NORMAL, move || {
                handler_fiber(id, stream, peer, conn_token, factory, shared, accept_reactor)
            });
        }
    }
    .await;

    if let Err(err) = result {
        warn!(error = %err, "accept loop terminated with error");
    }

    // Drain: cancel every live connection, then wait for the set to empty.
    {
        let conns = shared.connections.lock().await;
        debug!(live = conns.len(), "closing live connections");
        for token in conns.values() {
            token.cancel();
        }
    }
    let guard = shared.connections.lock().await;
    let _guard = shared
        .empty_cv
        .wait_while(guard, |conns| !conns.is_empty())
        .await;

    shared.done.notify();
    info!("accept server stopped");
}

/// One connection's fiber: build the handler on this reactor, drive it, and
/// unlink on the accept reactor when finished.
fn handler_fiber(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    conn_token: CancellationToken,
    factory: HandlerFactory,
    shared: Arc<ServerShared>,
    accept_reactor: ReactorHandle,
) -> impl Future<Output = ()> {
    async move {
        let ctx = ReactorContext::current();
        let mut handler = factory(&ctx);
        let mut conn = Connection {
            stream,
            peer,
            shutdown: conn_token.clone(),
        };

        let result = tokio::select! {
            res = handler.run(&mut conn) => res,
            _ = conn_token.cancelled() => Err(shutdown_error()),
        };
        match result {
            Ok(()) => debug!(%peer, "connection finished"),
            Err(err) => debug!(%peer, error = %err, "connection ended"),
        }

        // Unlink from the live set on the accept reactor; last handler out
        // signals the drain condvar.
        accept_reactor.post(move || {
            let ctx = ReactorContext::current();
            ctx.spawn(NiceLevel::NORMAL, async move {
                let mut conns = shared.connections.lock().await;
                conns.remove(&id);
                if conns.is_empty() {
                    shared.empty_cv.notify_all();
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::pool::ReactorPoolConfig;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    /// Echoes every received byte until EOF.
    struct EchoHandler;

    impl ConnectionHandler for EchoHandler {
        fn run<'a>(
            &'a mut self,
            conn: &'a mut Connection,
        ) -> Pin<Box<dyn Future<Output = io::Result<()>> + 'a>> {
            Box::pin(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = conn.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    conn.write_all(&buf[..n]).await?;
                }
            })
        }
    }

    fn echo_factory() -> HandlerFactory {
        Arc::new(|_ctx: &ReactorContext| Box::new(EchoHandler) as Box<dyn ConnectionHandler>)
    }

    fn test_config() -> AcceptServerConfig {
        AcceptServerConfig {
            handle_signals: false,
            ..AcceptServerConfig::default()
        }
    }

    fn start_pool(n: usize) -> ReactorPool {
        ReactorPool::start(ReactorPoolConfig {
            num_reactors: n,
            thread_name_prefix: "accept-test".to_string(),
        })
        .expect("pool start")
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let pool = start_pool(1);
        let server = AcceptServer::bind(test_config(), &pool, echo_factory()).expect("bind");
        assert_ne!(server.local_addr().port(), 0);
        pool.stop();
    }

    #[test]
    fn test_echo_roundtrip() {
        let pool = start_pool(2);
        let server = AcceptServer::bind(test_config(), &pool, echo_factory()).expect("bind");
        let addr = server.local_addr();
        server.run();

        let mut client =
            StdTcpStream::connect(("127.0.0.1", addr.port())).expect("client connect");
        client.write_all(b"hello\n").expect("client write");
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).expect("client read");
        assert_eq!(&buf, b"hello\n");
        drop(client);

        server.stop();
        server.wait_blocking();
        pool.stop();
    }

    #[test]
    fn test_stop_drains_live_connections() {
        let pool = start_pool(2);
        let server = AcceptServer::bind(test_config(), &pool, echo_factory()).expect("bind");
        let addr = server.local_addr();
        server.run();

        // Keep clients connected across the stop; their handlers must be
        // woken and drained before wait() returns.
        let mut clients = Vec::new();
        for _ in 0..4 {
            let mut c = StdTcpStream::connect(("127.0.0.1", addr.port())).expect("connect");
            c.write_all(b"ping").expect("write");
            let mut buf = [0u8; 4];
            c.read_exact(&mut buf).expect("read");
            clients.push(c);
        }

        server.stop();
        server.wait_blocking();
        drop(clients);
        pool.stop();
    }

    #[test]
    fn test_wait_without_run_returns() {
        let pool = start_pool(1);
        let server = AcceptServer::bind(test_config(), &pool, echo_factory()).expect("bind");
        server.wait_blocking();
        pool.stop();
    }
}
