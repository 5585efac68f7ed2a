//! Outbound TCP channel with background reconnect.
//!
//! A [`ClientChannel`] keeps a connected session to a `(host, port)` pair.
//! All socket state lives on the channel's owning reactor: callers on other
//! threads go through posted fibers, which keeps every socket mutation
//! single-threaded. When an operation fails, [`ClientChannel::handle_error_status`]
//! starts one background reconnect fiber (never more) at maintenance
//! priority; it retries with growing backoff until connected, shut down, or
//! re-armed for another attempt window.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar as StdCondvar, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Status;
use crate::fibers::Done;
use crate::reactor::{NiceLevel, ReactorHandle};

// =============================================================================
// Reconnect policy constants
// =============================================================================

/// First backoff between connect attempts.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Backoff growth per attempt.
const BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Margin under the deadline below which another attempt is pointless.
const DEADLINE_GUARD: Duration = Duration::from_millis(2);

/// Per-attempt deadline of the background reconnect fiber. The fiber re-arms
/// itself when an attempt window expires still disconnected.
const RECONNECT_ATTEMPT_DEADLINE: Duration = Duration::from_secs(30);

// =============================================================================
// Channel
// =============================================================================

struct ConnState {
    /// `Ok(())` while connected; the last error otherwise.
    status: Result<(), Status>,
    shutting_down: bool,
    /// True while the (single) reconnect fiber is alive.
    reconnect_active: bool,
}

struct Inner {
    reactor: ReactorHandle,
    host: String,
    port: u16,
    /// The socket; locked only by fibers of the owning reactor.
    sock: tokio::sync::Mutex<Option<TcpStream>>,
    state: StdMutex<ConnState>,
    /// Signalled by the reconnect fiber when it exits during shutdown.
    shutdown_cv: StdCondvar,
    /// Cancels in-flight socket operations on shutdown.
    cancel: CancellationToken,
}

/// Outbound TCP session with transparent background reconnect.
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<Inner>,
}

impl ClientChannel {
    /// Creates a disconnected channel owned by `reactor`.
    pub fn new(reactor: ReactorHandle, host: impl Into<String>, port: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                reactor,
                host: host.into(),
                port,
                sock: tokio::sync::Mutex::new(None),
                state: StdMutex::new(ConnState {
                    status: Err(Status::transport("not connected")),
                    shutting_down: false,
                    reconnect_active: false,
                }),
                shutdown_cv: StdCondvar::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Current connection status: `Ok(())` while connected.
    pub fn status(&self) -> Result<(), Status> {
        self.inner.lock_state().status.clone()
    }

    /// Whether the background reconnect fiber is currently active.
    pub fn is_reconnect_active(&self) -> bool {
        self.inner.lock_state().reconnect_active
    }

    /// Establishes the connection, blocking the calling thread for at most
    /// `timeout`. The work itself runs as a fiber on the owning reactor.
    ///
    /// # Panics
    ///
    /// Panics if called while shutting down or while a background reconnect
    /// is active; that is a programmer error.
    pub fn connect_blocking(&self, timeout: Duration) -> Result<(), Status> {
        if let Some(done) = self.start_connect(timeout) {
            done.wait_blocking();
        }
        self.status()
    }

    /// Async variant of [`ClientChannel::connect_blocking`]; suspends the
    /// calling fiber instead of blocking its thread.
    pub async fn connect(&self, timeout: Duration) -> Result<(), Status> {
        if let Some(done) = self.start_connect(timeout) {
            done.wait().await;
        }
        self.status()
    }

    /// Returns `None` when already connected, otherwise the `Done` the
    /// connect fiber will signal.
    fn start_connect(&self, timeout: Duration) -> Option<Done> {
        {
            let state = self.inner.lock_state();
            assert!(
                !state.shutting_down && !state.reconnect_active,
                "connect during shutdown or active reconnect"
            );
            if state.status.is_ok() {
                return None;
            }
        }
        let done = Done::new();
        let fiber_done = done.clone();
        let inner = Arc::clone(&self.inner);
        let until = Instant::now() + timeout;
        self.inner
            .reactor
            .spawn_fn(NiceLevel::NORMAL, move || async move {
                inner.resolve_and_connect(until).await;
                fiber_done.notify();
            });
        Some(done)
    }

    /// Records a failed operation and, unless already shutting down or
    /// reconnecting, starts the background reconnect fiber.
    pub fn handle_error_status(&self, status: Status) {
        let mut state = self.inner.lock_state();
        state.status = Err(status.clone());
        if state.shutting_down || state.reconnect_active {
            return;
        }
        info!(error = %status, host = %self.inner.host, "channel error; reconnecting in background");
        state.reconnect_active = true;
        drop(state);
        Inner::spawn_reconnect(Arc::clone(&self.inner));
    }

    /// Shuts the channel down: cancels in-flight socket operations, closes
    /// the socket on the owning reactor, and blocks until any background
    /// reconnect fiber has drained. Idempotent.
    ///
    /// Must be called from outside the owning reactor (a fiber calling this
    /// would block its own reactor), and before the owning pool is stopped.
    pub fn shutdown(&self) {
        let first = {
            let mut state = self.inner.lock_state();
            if state.shutting_down {
                false
            } else {
                state.shutting_down = true;
                true
            }
        };
        if first {
            self.inner.cancel.cancel();
            if !self.inner.reactor.is_stopped() {
                let done = Done::new();
                let fiber_done = done.clone();
                let inner = Arc::clone(&self.inner);
                self.inner
                    .reactor
                    .spawn_fn(NiceLevel::NORMAL, move || async move {
                        let mut sock = inner.sock.lock().await;
                        if sock.take().is_some() {
                            debug!(host = %inner.host, "socket closed on shutdown");
                        }
                        fiber_done.notify();
                    });
                done.wait_blocking();
            }
        }

        let mut state = self.inner.lock_state();
        while state.reconnect_active {
            state = self
                .inner
                .shutdown_cv
                .wait(state)
                .expect("channel state poisoned");
        }
    }

    /// Writes the whole buffer on the connected socket. Must be called from
    /// a fiber of the owning reactor. On error, pass the status to
    /// [`ClientChannel::handle_error_status`].
    pub async fn write_all(&self, buf: &[u8]) -> Result<(), Status> {
        let mut sock = self.inner.sock.lock().await;
        let Some(stream) = sock.as_mut() else {
            return Err(Status::transport("channel not connected"));
        };
        tokio::select! {
            res = stream.write_all(buf) => res.map_err(Status::from),
            _ = self.inner.cancel.cancelled() => Err(Status::aborted("channel shutdown")),
        }
    }

    /// Reads from the connected socket. Must be called from a fiber of the
    /// owning reactor.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Status> {
        let mut sock = self.inner.sock.lock().await;
        let Some(stream) = sock.as_mut() else {
            return Err(Status::transport("channel not connected"));
        };
        tokio::select! {
            res = stream.read(buf) => res.map_err(Status::from),
            _ = self.inner.cancel.cancelled() => Err(Status::aborted("channel shutdown")),
        }
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("ClientChannel")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("connected", &state.status.is_ok())
            .field("reconnect_active", &state.reconnect_active)
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().expect("channel state poisoned")
    }

    fn shutting_down(&self) -> bool {
        self.lock_state().shutting_down
    }

    fn status_ok(&self) -> bool {
        self.lock_state().status.is_ok()
    }

    fn set_status(&self, status: Result<(), Status>) {
        self.lock_state().status = status;
    }

    /// Resolve the host and connect, retrying with growing backoff until the
    /// deadline. Runs as a fiber on the owning reactor.
    async fn resolve_and_connect(&self, until: Instant) {
        let mut sleep_dur = INITIAL_BACKOFF;

        while !self.shutting_down() && !self.status_ok() && Instant::now() < until {
            match lookup_host((self.host.as_str(), self.port)).await {
                Ok(addrs) => {
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    tokio::select! {
                        res = connect_endpoints(&addrs) => match res {
                            Ok(stream) => {
                                let _ = stream.set_nodelay(true);
                                *self.sock.lock().await = Some(stream);
                                self.set_status(Ok(()));
                                debug!(host = %self.host, port = self.port, "connected");
                                return;
                            }
                            Err(err) => {
                                self.set_status(Err(Status::from(err)));
                            }
                        },
                        _ = tokio::time::sleep_until(until) => {
                            // Deadline fired first; the pending connect is
                            // dropped (cancelled) with the select arm.
                        }
                        _ = self.cancel.cancelled() => {}
                    }
                }
                Err(err) => {
                    debug!(host = %self.host, error = %err, "resolve failed");
                }
            }

            let now = Instant::now();
            if self.shutting_down() || now + DEADLINE_GUARD >= until {
                self.set_status(Err(Status::aborted("connect deadline expired")));
                return;
            }
            let wake_at = std::cmp::min(now + sleep_dur, until - DEADLINE_GUARD);
            tokio::time::sleep_until(wake_at).await;
            if sleep_dur < MAX_BACKOFF {
                sleep_dur += BACKOFF_STEP;
            }
        }
    }

    /// Spawns the reconnect fiber at maintenance priority so it never delays
    /// latency-critical fibers on the same reactor.
    fn spawn_reconnect(inner: Arc<Inner>) {
        let reactor = inner.reactor.clone();
        reactor.spawn_fn(NiceLevel::MAINTENANCE, move || Inner::reconnect_fiber(inner));
    }

    async fn reconnect_fiber(self: Arc<Self>) {
        self.resolve_and_connect(Instant::now() + RECONNECT_ATTEMPT_DEADLINE)
            .await;

        let mut state = self.lock_state();
        debug_assert!(state.reconnect_active);

        if !state.shutting_down && state.status.is_err() {
            // Attempt window expired still disconnected: re-arm.
            drop(state);
            Inner::spawn_reconnect(Arc::clone(&self));
            return;
        }

        state.reconnect_active = false;
        if state.shutting_down {
            self.shutdown_cv.notify_all();
        } else {
            info!(host = %self.host, port = self.port, "channel reconnected");
        }
    }
}

/// Try each resolved endpoint in order; first successful connect wins.
async fn connect_endpoints(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no endpoints resolved");
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::pool::{ReactorPool, ReactorPoolConfig};
    use std::net::TcpListener as StdTcpListener;
    use std::time::Instant as StdInstant;

    fn start_pool() -> ReactorPool {
        ReactorPool::start(ReactorPoolConfig {
            num_reactors: 1,
            thread_name_prefix: "channel-test".to_string(),
        })
        .expect("pool start")
    }

    #[test]
    fn test_connect_to_listening_server() {
        let pool = start_pool();
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("listener");
        let port = listener.local_addr().unwrap().port();

        let channel = ClientChannel::new(pool.handle(0), "127.0.0.1", port);
        channel
            .connect_blocking(Duration::from_secs(5))
            .expect("connect");
        assert!(channel.status().is_ok());

        channel.shutdown();
        pool.stop();
    }

    #[test]
    fn test_connect_times_out_against_dead_port() {
        let pool = start_pool();
        // Bind then drop to get a port that refuses connections.
        let port = {
            let l = StdTcpListener::bind("127.0.0.1:0").expect("listener");
            l.local_addr().unwrap().port()
        };

        let channel = ClientChannel::new(pool.handle(0), "127.0.0.1", port);
        let start = StdInstant::now();
        let result = channel.connect_blocking(Duration::from_millis(300));
        assert!(result.is_err());
        // Refused connections fail fast; the backoff loop must still respect
        // the deadline rather than spinning forever.
        assert!(start.elapsed() < Duration::from_secs(5));

        channel.shutdown();
        pool.stop();
    }

    #[test]
    fn test_single_reconnect_fiber() {
        let pool = start_pool();
        let port = {
            let l = StdTcpListener::bind("127.0.0.1:0").expect("listener");
            l.local_addr().unwrap().port()
        };
        let channel = ClientChannel::new(pool.handle(0), "127.0.0.1", port);

        channel.handle_error_status(Status::transport("simulated I/O error"));
        assert!(channel.is_reconnect_active());

        // Further errors while a reconnect is active must not spawn more
        // fibers; the flag stays set and shutdown still drains exactly one.
        for _ in 0..5 {
            channel.handle_error_status(Status::transport("another error"));
        }
        assert!(channel.is_reconnect_active());

        let start = StdInstant::now();
        channel.shutdown();
        assert!(!channel.is_reconnect_active());
        // The fiber sleeps at most MAX_BACKOFF between attempts, so shutdown
        // completes well under the attempt deadline.
        assert!(start.elapsed() < Duration::from_secs(5));
        pool.stop();
    }

    #[test]
    fn test_reconnect_succeeds_when_server_appears() {
        let pool = start_pool();
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("listener");
        let port = listener.local_addr().unwrap().port();

        let channel = ClientChannel::new(pool.handle(0), "127.0.0.1", port);
        channel.handle_error_status(Status::transport("simulated error"));

        let deadline = StdInstant::now() + Duration::from_secs(10);
        while channel.status().is_err() && StdInstant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(channel.status().is_ok(), "background reconnect connected");
        assert!(!channel.is_reconnect_active());

        channel.shutdown();
        pool.stop();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = start_pool();
        let channel = ClientChannel::new(pool.handle(0), "127.0.0.1", 1);
        channel.shutdown();
        channel.shutdown();
        pool.stop();
    }
}
