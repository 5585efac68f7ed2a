//! End-to-end tests for the accept server and client channel over a real
//! reactor pool: concurrent echo traffic, graceful drain, and reconnect
//! across a listener outage.

use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::net::accept_server::HandlerFactory;
use weft::reactor::pool::ReactorPoolConfig;
use weft::{
    AcceptServer, AcceptServerConfig, ClientChannel, Connection, ConnectionHandler, ReactorPool,
    Status,
};

// =============================================================================
// Test helpers
// =============================================================================

/// Echoes every received byte until EOF or shutdown.
struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn run<'a>(
        &'a mut self,
        conn: &'a mut Connection,
    ) -> Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + 'a>> {
        Box::pin(async move {
            let mut buf = [0u8; 4096];
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
    Arc::new(|_ctx| Box::new(EchoHandler) as Box<dyn ConnectionHandler>)
}

fn start_pool(n: usize) -> ReactorPool {
    ReactorPool::start(ReactorPoolConfig {
        num_reactors: n,
        thread_name_prefix: "it-reactor".to_string(),
    })
    .expect("pool start")
}

fn test_server_config() -> AcceptServerConfig {
    AcceptServerConfig {
        handle_signals: false,
        ..AcceptServerConfig::default()
    }
}

// =============================================================================
// Echo server
// =============================================================================

#[test]
fn test_concurrent_echo_clients() {
    let _ = weft::logging::try_init_logging("warn");

    let pool = start_pool(4);
    let server = AcceptServer::bind(test_server_config(), &pool, echo_factory()).expect("bind");
    let port = server.local_addr().port();
    server.run();

    const CLIENTS: usize = 20;
    const MESSAGES: usize = 100;

    let mut clients = Vec::new();
    for client_id in 0..CLIENTS {
        clients.push(std::thread::spawn(move || {
            let mut stream =
                StdTcpStream::connect(("127.0.0.1", port)).expect("client connect");
            let payload = format!("hello from {client_id}\n");
            let mut echo = vec![0u8; payload.len()];
            for _ in 0..MESSAGES {
                stream.write_all(payload.as_bytes()).expect("client write");
                stream.read_exact(&mut echo).expect("client read");
                assert_eq!(echo, payload.as_bytes());
            }
        }));
    }
    for client in clients {
        client.join().expect("client thread");
    }

    server.stop();
    server.wait_blocking();
    pool.stop();
}

#[test]
fn test_graceful_stop_with_idle_connections() {
    let pool = start_pool(2);
    let server = AcceptServer::bind(test_server_config(), &pool, echo_factory()).expect("bind");
    let port = server.local_addr().port();
    server.run();

    // Idle connections: their handlers sit in read() until shutdown wakes
    // them with an error.
    let clients: Vec<_> = (0..8)
        .map(|_| StdTcpStream::connect(("127.0.0.1", port)).expect("connect"))
        .collect();
    std::thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    server.stop();
    server.wait_blocking();
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "drain must not hang on idle connections"
    );
    drop(clients);
    pool.stop();
}

// =============================================================================
// Client channel across a listener outage
// =============================================================================

#[test]
fn test_client_channel_reconnects_across_gap() {
    let _ = weft::logging::try_init_logging("warn");

    let pool = start_pool(1);
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().unwrap().port();

    let channel = ClientChannel::new(pool.handle(0), "127.0.0.1", port);
    channel
        .connect_blocking(Duration::from_secs(5))
        .expect("initial connect");

    // The listener goes away: trigger the error path as an I/O caller would.
    drop(listener);
    channel.handle_error_status(Status::transport("peer went away"));
    assert!(channel.is_reconnect_active());

    // Gap, then the server comes back on the same port.
    std::thread::sleep(Duration::from_millis(300));
    let _listener = std::net::TcpListener::bind(("127.0.0.1", port)).expect("rebind");

    let deadline = Instant::now() + Duration::from_secs(10);
    while channel.status().is_err() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(
        channel.status().is_ok(),
        "channel must reconnect once the listener returns"
    );

    channel.shutdown();
    pool.stop();
}

#[test]
fn test_client_channel_shutdown_during_gap() {
    let pool = start_pool(1);
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").expect("listener");
        l.local_addr().unwrap().port()
    };

    let channel = ClientChannel::new(pool.handle(0), "127.0.0.1", port);
    channel.handle_error_status(Status::transport("no server"));
    assert!(channel.is_reconnect_active());

    std::thread::sleep(Duration::from_millis(150));
    let start = Instant::now();
    channel.shutdown();
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "shutdown during the outage must drain the reconnect fiber promptly"
    );
    assert!(!channel.is_reconnect_active());
    pool.stop();
}
