//! `weft echo` — a TCP echo server over the reactor pool.
//!
//! Runs until SIGINT/SIGTERM, then drains live connections gracefully.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use weft::net::accept_server::HandlerFactory;
use weft::{
    AcceptServer, AcceptServerConfig, Connection, ConnectionHandler, ReactorPool,
    ReactorPoolConfig,
};

use crate::error::CliError;

/// Echoes every received byte back to the peer until EOF.
struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn run<'a>(
        &'a mut self,
        conn: &'a mut Connection,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + 'a>> {
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

pub fn run(port: u16, reactors: Option<usize>) -> Result<(), CliError> {
    let pool_config = reactors
        .map(ReactorPoolConfig::with_reactors)
        .unwrap_or_default();
    let pool = ReactorPool::start(pool_config)?;

    let factory: HandlerFactory =
        Arc::new(|_ctx| Box::new(EchoHandler) as Box<dyn ConnectionHandler>);
    let server = AcceptServer::bind(AcceptServerConfig::with_port(port), &pool, factory)?;
    info!(
        port = server.local_addr().port(),
        "echo server running; stop with SIGINT/SIGTERM"
    );

    server.run();
    server.wait_blocking();
    pool.stop();
    Ok(())
}
