//! portmuxd
//!
//! Serves several protocols on one TCP port:
//! - HTTP/1.x requests get a short plain-text reply
//! - HTTP/2 and TLS clients are identified in the logs and closed
//! - anything else is echoed back

use std::future::Future;
use std::io;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use portmux::matcher::{self, SniResult};
use portmux::{Mux, MuxConn, MuxError, MuxListener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

/// Upper bound on an HTTP/1 request head we are willing to read.
const MAX_REQUEST_HEAD: usize = 8192;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portmuxd");
    info!(
        listen_addr = %config.listen_addr,
        queue_capacity = config.queue_capacity,
        proxy_protocol = ?config.proxy_protocol,
        sniff_timeout_ms = config.sniff_timeout.map(|t| t.as_millis() as u64),
        "Configuration loaded"
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let mut mux = Mux::with_config(listener, config.mux_config());
    mux.handle_error(|err| {
        debug!(error = %err, "Mux error");
        true
    });

    // Registration order is match priority.
    let routes = vec![
        spawn_route("http1", mux.route([matcher::http1_fast(&[])]), serve_http1),
        spawn_route("http2", mux.route([matcher::http2()]), reject_http2),
        spawn_route("tls", mux.route([matcher::tls()]), reject_tls),
        spawn_route("echo", mux.route([matcher::any()]), serve_echo),
    ];

    let handle = mux.handle();
    let serving = tokio::spawn(mux.serve());

    tokio::spawn({
        let handle = handle.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal");
                    handle.close();
                }
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    });

    let result = serving.await.context("Mux task panicked")?;
    join_routes(routes).await;

    let stats = handle.stats();
    info!(
        accepted = stats.connections_accepted.load(Ordering::Relaxed),
        matched = stats.connections_matched.load(Ordering::Relaxed),
        unmatched = stats.connections_unmatched.load(Ordering::Relaxed),
        "portmuxd stopped"
    );

    result.context("Mux stopped")
}

/// Wait for every route task, logging the ones that panicked. Returns how
/// many failed.
async fn join_routes(routes: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for route in routes {
        if let Err(e) = route.await {
            error!(error = %e, "Route task failed");
            failed += 1;
        }
    }
    failed
}

/// Accept from one route until the mux closes it, serving each connection on
/// its own task.
fn spawn_route<F, Fut>(
    name: &'static str,
    listener: MuxListener<TcpStream>,
    serve: F,
) -> JoinHandle<()>
where
    F: Fn(MuxConn<TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let span = match conn.peer_addr() {
                        Ok(peer) => info_span!("route", route = name, peer = %peer),
                        Err(_) => info_span!("route", route = name),
                    };
                    let fut = serve(conn);
                    tokio::spawn(
                        async move {
                            if let Err(e) = fut.await {
                                debug!(error = %e, "Connection error");
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(MuxError::ListenerClosed) => break,
                Err(e) => {
                    warn!(route = name, error = %e, "Route accept failed");
                    break;
                }
            }
        }
        info!(route = name, "Route closed");
    })
}

async fn serve_http1(mut conn: MuxConn<TcpStream>) -> io::Result<()> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        if head.len() >= MAX_REQUEST_HEAD {
            conn.write_all(b"HTTP/1.1 431 Request Header Fields Too Large\r\nConnection: close\r\n\r\n")
                .await?;
            return conn.shutdown().await;
        }
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&chunk[..n]);
    }

    let request_line = head
        .split(|b| *b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim_end().to_string())
        .unwrap_or_default();
    info!(request = %request_line, "HTTP/1 request");

    let body = format!("portmux: {request_line}\n");
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    conn.write_all(response.as_bytes()).await?;
    conn.shutdown().await
}

async fn reject_http2(mut conn: MuxConn<TcpStream>) -> io::Result<()> {
    info!("HTTP/2 client, no HTTP/2 backend configured");
    conn.shutdown().await
}

async fn reject_tls(mut conn: MuxConn<TcpStream>) -> io::Result<()> {
    let mut hello = vec![0u8; matcher::DEFAULT_MAX_SNIFF_BYTES];
    let n = conn.read(&mut hello).await?;
    match matcher::parse_sni(&hello[..n]) {
        SniResult::Found(hostname) => info!(sni = %hostname, "TLS client, not terminated here"),
        other => info!(result = ?other, "TLS client, not terminated here"),
    }
    conn.shutdown().await
}

async fn serve_echo(conn: MuxConn<TcpStream>) -> io::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(conn);
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    debug!(bytes = copied, "Echo finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_routes_reports_panicked_route() {
        let routes: Vec<JoinHandle<()>> = vec![
            tokio::spawn(async {}),
            tokio::spawn(async { panic!("route server bug") }),
            tokio::spawn(async {}),
        ];
        assert_eq!(join_routes(routes).await, 1);
    }
}
