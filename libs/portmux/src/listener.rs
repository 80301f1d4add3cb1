//! Root and per-route listeners.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::conn::{Connection, MuxConn};
use crate::error::MuxError;

/// A source of connections the mux can own.
#[async_trait]
pub trait Listener: Send + 'static {
    type Conn: Connection;

    /// Wait for the next connection.
    async fn accept(&mut self) -> io::Result<Self::Conn>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> io::Result<TcpStream> {
        let (stream, _) = TcpListener::accept(self).await?;
        Ok(stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A matched connection on its way to a route.
pub(crate) struct Handoff<S> {
    pub(crate) conn: MuxConn<S>,
    /// Present for synchronous routes: fired once `accept` has taken the
    /// connection.
    pub(crate) ack: Option<oneshot::Sender<()>>,
}

/// Listener for one route, returned by [`Mux::route`](crate::Mux::route).
///
/// `accept` yields the connections the mux matched to this route. After the
/// mux stops serving, queued connections are still handed out, then every
/// call fails with [`MuxError::ListenerClosed`]. Several tasks may share one
/// listener and accept concurrently.
pub struct MuxListener<S> {
    rx: Mutex<mpsc::Receiver<Handoff<S>>>,
    closed: watch::Sender<bool>,
    local_addr: Option<SocketAddr>,
}

impl<S: Connection> MuxListener<S> {
    pub(crate) fn new(rx: mpsc::Receiver<Handoff<S>>, local_addr: Option<SocketAddr>) -> Self {
        Self {
            rx: Mutex::new(rx),
            closed: watch::Sender::new(false),
            local_addr,
        }
    }

    /// Wait for the next connection matched to this route.
    pub async fn accept(&self) -> Result<MuxConn<S>, MuxError> {
        let mut closed = self.closed.subscribe();
        let handoff = {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                biased;
                _ = closed.wait_for(|c| *c) => {
                    close_and_drain(&mut rx);
                    None
                }
                handoff = rx.recv() => handoff,
            }
        };
        // `close` may have found the lock held by this call.
        if *self.closed.borrow() {
            if let Ok(mut rx) = self.rx.try_lock() {
                close_and_drain(&mut rx);
            }
        }

        match handoff {
            Some(Handoff { conn, ack }) => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                Ok(conn)
            }
            None => Err(MuxError::ListenerClosed),
        }
    }

    /// Stop accepting on this route only. The mux and its other routes keep
    /// serving. Connections already queued here, and any matched here
    /// afterwards, are dropped.
    pub fn close(&self) {
        self.closed.send_replace(true);
        // A pending `accept` holds the lock and drains once it sees the flag.
        if let Ok(mut rx) = self.rx.try_lock() {
            close_and_drain(&mut rx);
        }
    }

    /// The root listener's address, if it was known at registration.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Dropping a queued hand-off closes its connection and releases a worker
/// waiting on the acknowledgement.
fn close_and_drain<S>(rx: &mut mpsc::Receiver<Handoff<S>>) {
    rx.close();
    while let Ok(handoff) = rx.try_recv() {
        drop(handoff);
    }
}

/// Route listeners can feed another mux, so connections can be matched in
/// stages (for example plaintext first, then again inside TLS).
#[async_trait]
impl<S: Connection> Listener for MuxListener<S> {
    type Conn = MuxConn<S>;

    async fn accept(&mut self) -> io::Result<MuxConn<S>> {
        MuxListener::accept(self).await.map_err(io::Error::other)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.local_addr
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "unknown local address"))
    }
}

impl<S> std::fmt::Debug for MuxListener<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxListener")
            .field("local_addr", &self.local_addr)
            .field("closed", &*self.closed.borrow())
            .finish_non_exhaustive()
    }
}
