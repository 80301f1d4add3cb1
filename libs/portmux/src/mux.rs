//! The connection multiplexer.
//!
//! [`Mux`] owns a root [`Listener`]. Each accepted connection gets its own
//! worker task, which optionally consumes a PROXY header and then tries the
//! registered routes in registration order, and within a route its matchers
//! in order. The first matcher to say yes wins: the connection, rewound to
//! its first byte, is queued on that route's [`MuxListener`]. Connections no
//! matcher wants are closed and reported to the error handler.
//!
//! Serving stops when [`MuxHandle::close`] is called, when the root
//! listener fails with a non-temporary error, or when the error handler
//! refuses an error. The root listener is then dropped, in-flight workers
//! are stopped and waited for, and only then are the route queues closed:
//! queued connections stay available to `accept`, after which every route
//! listener reports [`MuxError::ListenerClosed`].

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{MuxConfig, ProxyErrorAction, ProxyProtocol};
use crate::conn::{Connection, MuxConn};
use crate::error::{MuxError, ProxyHeaderError};
use crate::listener::{Handoff, Listener, MuxListener};
use crate::matcher::MatcherRef;

/// Decides whether serving continues after an error. Returning `false`
/// stops the mux.
pub type ErrorHandler = Arc<dyn Fn(&MuxError) -> bool + Send + Sync>;

/// Counters for one mux.
#[derive(Debug, Default)]
pub struct MuxStats {
    /// Connections accepted from the root listener.
    pub connections_accepted: AtomicU64,
    /// Connections currently being matched or handed off.
    pub connections_active: AtomicU64,
    /// Connections delivered to a route queue.
    pub connections_matched: AtomicU64,
    /// Connections closed because no matcher wanted them.
    pub connections_unmatched: AtomicU64,
    /// Matched connections dropped at shutdown or by a closed route.
    pub connections_dropped: AtomicU64,
    /// PROXY headers consumed.
    pub proxy_headers: AtomicU64,
    /// Malformed PROXY headers.
    pub proxy_errors: AtomicU64,
    /// Failed accepts on the root listener.
    pub accept_errors: AtomicU64,
}

/// Shutdown flag shared by the serve loop, workers and handles.
#[derive(Debug)]
struct Shutdown {
    flag: watch::Sender<bool>,
    /// The refused per-connection error that triggered shutdown, if any.
    cause: Mutex<Option<MuxError>>,
}

impl Shutdown {
    fn new() -> Self {
        Self {
            flag: watch::Sender::new(false),
            cause: Mutex::new(None),
        }
    }

    fn trigger(&self) {
        self.flag.send_replace(true);
    }

    /// Trigger shutdown on behalf of a worker. Only the first cause is kept.
    fn escalate(&self, err: MuxError) {
        if let Ok(mut cause) = self.cause.lock() {
            cause.get_or_insert(err);
        }
        self.trigger();
    }

    fn take_cause(&self) -> Option<MuxError> {
        self.cause.lock().ok().and_then(|mut cause| cause.take())
    }

    fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.flag.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Cloneable control handle for a running [`Mux`].
#[derive(Debug, Clone)]
pub struct MuxHandle {
    shutdown: Arc<Shutdown>,
    stats: Arc<MuxStats>,
}

impl MuxHandle {
    /// Stop serving. The root listener is dropped and route listeners
    /// report [`MuxError::ListenerClosed`] once their queues are drained.
    pub fn close(&self) {
        self.shutdown.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn stats(&self) -> &MuxStats {
        &self.stats
    }
}

struct Route<S> {
    matchers: Vec<MatcherRef>,
    tx: mpsc::Sender<Handoff<S>>,
    /// Capacity 0: the worker waits until `accept` takes the connection.
    synchronous: bool,
}

/// Connection multiplexer over a root listener.
pub struct Mux<L: Listener> {
    root: L,
    config: MuxConfig,
    routes: Vec<Route<L::Conn>>,
    error_handler: ErrorHandler,
    shutdown: Arc<Shutdown>,
    stats: Arc<MuxStats>,
}

impl<L: Listener> Mux<L> {
    /// Wrap `root` with the default configuration.
    pub fn new(root: L) -> Self {
        Self::with_config(root, MuxConfig::default())
    }

    pub fn with_config(root: L, config: MuxConfig) -> Self {
        Self {
            root,
            config,
            routes: Vec::new(),
            error_handler: Arc::new(|_| true),
            shutdown: Arc::new(Shutdown::new()),
            stats: Arc::new(MuxStats::default()),
        }
    }

    /// Register a route. Routes are tried in registration order; a
    /// connection goes to the first route with a matching matcher.
    ///
    /// A route with no matchers never matches.
    pub fn route<I>(&mut self, matchers: I) -> MuxListener<L::Conn>
    where
        I: IntoIterator<Item = MatcherRef>,
    {
        let capacity = self.config.queue_capacity;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.routes.push(Route {
            matchers: matchers.into_iter().collect(),
            tx,
            synchronous: capacity == 0,
        });
        MuxListener::new(rx, self.root.local_addr().ok())
    }

    /// Replace the error handler. The default continues after every
    /// temporary error.
    pub fn handle_error<F>(&mut self, handler: F)
    where
        F: Fn(&MuxError) -> bool + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
    }

    pub fn handle(&self) -> MuxHandle {
        MuxHandle {
            shutdown: Arc::clone(&self.shutdown),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.root.local_addr()
    }

    /// Accept and dispatch connections until the mux is closed or fails.
    ///
    /// Returns `Ok(())` after [`MuxHandle::close`]. Otherwise returns the
    /// accept error or refused connection error that stopped serving.
    pub async fn serve(self) -> Result<(), MuxError> {
        let Mux {
            mut root,
            config,
            routes,
            error_handler,
            shutdown,
            stats,
        } = self;

        info!(
            bind_addr = ?root.local_addr().ok(),
            routes = routes.len(),
            queue_capacity = config.queue_capacity,
            proxy_protocol = ?config.proxy_protocol,
            "Mux started"
        );

        let dispatcher = Arc::new(Dispatcher {
            routes,
            config,
            error_handler,
            shutdown: Arc::clone(&shutdown),
            stats: Arc::clone(&stats),
        });
        let mut workers = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = shutdown.wait() => break Ok(()),
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(joined);
                }
                accepted = root.accept() => match accepted {
                    Ok(conn) => {
                        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        let active = ActiveGuard::enter(&stats);
                        let span = match conn.peer_addr() {
                            Ok(peer) => info_span!("connection", peer = %peer),
                            Err(_) => info_span!("connection", peer = "unknown"),
                        };
                        let dispatcher = Arc::clone(&dispatcher);
                        workers.spawn(dispatcher.serve_conn(conn, active).instrument(span));
                    }
                    Err(e) => {
                        stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                        let err = MuxError::Accept(e);
                        if !dispatcher.handle_err(&err) {
                            error!(error = %err, "Accept failed, stopping mux");
                            break Err(err);
                        }
                        warn!(error = %err, "Accept error");
                    }
                },
            }
        };

        drop(root);
        shutdown.trigger();
        while let Some(joined) = workers.join_next().await {
            log_worker_exit(joined);
        }
        // Last reference: dropping it closes every route queue.
        drop(dispatcher);

        info!(
            accepted = stats.connections_accepted.load(Ordering::Relaxed),
            matched = stats.connections_matched.load(Ordering::Relaxed),
            unmatched = stats.connections_unmatched.load(Ordering::Relaxed),
            "Mux stopped"
        );

        match result {
            Ok(()) => match shutdown.take_cause() {
                Some(cause) => Err(cause),
                None => Ok(()),
            },
            Err(err) => Err(err),
        }
    }
}

fn log_worker_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Connection worker panicked");
        }
    }
}

/// Counts a worker in `connections_active` until it ends, panics included.
struct ActiveGuard(Arc<MuxStats>);

impl ActiveGuard {
    fn enter(stats: &Arc<MuxStats>) -> Self {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(stats))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Outcome of sniffing one connection.
enum Sniffed {
    Route(usize),
    NoMatch,
    Rejected,
}

/// State shared by all connection workers of one mux.
struct Dispatcher<S> {
    routes: Vec<Route<S>>,
    config: MuxConfig,
    error_handler: ErrorHandler,
    shutdown: Arc<Shutdown>,
    stats: Arc<MuxStats>,
}

impl<S: Connection> Dispatcher<S> {
    /// Ask the handler about `err`. Serving continues only if the handler
    /// agrees and the error is temporary.
    fn handle_err(&self, err: &MuxError) -> bool {
        if !(self.error_handler)(err) {
            return false;
        }
        err.is_temporary()
    }

    /// Report a failure confined to one connection.
    fn report(&self, err: MuxError) {
        if self.handle_err(&err) {
            return;
        }
        if self.config.escalate_on_refusal {
            warn!(error = %err, "Error handler refused connection error, stopping mux");
            self.shutdown.escalate(err);
        } else {
            debug!(error = %err, "Error handler refused connection error");
        }
    }

    async fn serve_conn(self: Arc<Self>, raw: S, _active: ActiveGuard) {
        let mut conn = MuxConn::new(raw);

        let sniffed = tokio::select! {
            biased;
            sniffed = self.sniff(&mut conn) => Some(sniffed),
            _ = self.shutdown.wait() => None,
        };

        match sniffed {
            Some(Sniffed::Route(idx)) => self.hand_off(idx, conn).await,
            Some(Sniffed::NoMatch) => {
                self.stats
                    .connections_unmatched
                    .fetch_add(1, Ordering::Relaxed);
                let remote = remote_addr(&conn);
                drop(conn);
                warn!(peer_addr = %remote, "No route matched, connection closed");
                self.report(MuxError::NotMatched { remote });
            }
            Some(Sniffed::Rejected) => {}
            None => debug!("Mux closed while matching"),
        }
    }

    async fn sniff(&self, conn: &mut MuxConn<S>) -> Sniffed {
        let deadline = self.config.sniff_timeout.map(|t| Instant::now() + t);

        if self.config.proxy_protocol == ProxyProtocol::Optional {
            let read = within(deadline, conn.read_proxy_header(self.config.proxy_header_max))
                .await
                .unwrap_or_else(|| {
                    Err(ProxyHeaderError::Io(std::io::Error::from(
                        std::io::ErrorKind::TimedOut,
                    )))
                });

            match read {
                Ok(Some(header)) => {
                    self.stats.proxy_headers.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        src_addr = %header.src_addr,
                        dst_addr = %header.dst_addr,
                        "PROXY header consumed"
                    );
                }
                Ok(None) => {}
                Err(source) => {
                    self.stats.proxy_errors.fetch_add(1, Ordering::Relaxed);
                    let remote = remote_addr(conn);
                    warn!(
                        peer_addr = %remote,
                        error = %source,
                        action = ?self.config.on_proxy_error,
                        "Invalid PROXY header"
                    );
                    self.report(MuxError::ProxyHeader { remote, source });
                    if self.config.on_proxy_error == ProxyErrorAction::Reject {
                        return Sniffed::Rejected;
                    }
                }
            }
        }

        let mut winner = None;
        'routes: for (idx, route) in self.routes.iter().enumerate() {
            for matcher in &route.matchers {
                let hit = {
                    let mut sniffer = conn.sniffer();
                    within(deadline, matcher.matches(&mut sniffer))
                        .await
                        .unwrap_or(false)
                };
                conn.reset();
                if hit {
                    winner = Some(idx);
                    break 'routes;
                }
            }
        }
        conn.finish_sniffing();

        match winner {
            Some(idx) => Sniffed::Route(idx),
            None => Sniffed::NoMatch,
        }
    }

    async fn hand_off(&self, idx: usize, conn: MuxConn<S>) {
        let route = &self.routes[idx];
        let (ack, acked) = if route.synchronous {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // A free slot wins over a concurrent shutdown.
        let delivered = tokio::select! {
            biased;
            sent = route.tx.send(Handoff { conn, ack }) => sent.is_ok(),
            _ = self.shutdown.wait() => false,
        };

        if !delivered {
            self.stats
                .connections_dropped
                .fetch_add(1, Ordering::Relaxed);
            debug!(route = idx, "Matched connection dropped");
            return;
        }

        self.stats
            .connections_matched
            .fetch_add(1, Ordering::Relaxed);
        debug!(route = idx, "Connection matched");

        if let Some(acked) = acked {
            tokio::select! {
                biased;
                _ = acked => {}
                _ = self.shutdown.wait() => {}
            }
        }
    }
}

/// Run `fut` until the optional deadline. `None` means it expired.
async fn within<F: std::future::Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn remote_addr<S: Connection>(conn: &MuxConn<S>) -> SocketAddr {
    conn.peer_addr()
        .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::conn::tests::PipeConn;
    use crate::matcher::{any, from_fn, prefix};

    /// Root listener fed from a channel. A closed channel is a fatal error.
    struct ChanListener {
        rx: mpsc::Receiver<io::Result<PipeConn>>,
    }

    #[async_trait]
    impl Listener for ChanListener {
        type Conn = PipeConn;

        async fn accept(&mut self) -> io::Result<PipeConn> {
            match self.rx.recv().await {
                Some(conn) => conn,
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("10.2.2.2:80".parse().unwrap())
        }
    }

    fn chan_listener() -> (ChanListener, mpsc::Sender<io::Result<PipeConn>>) {
        let (tx, rx) = mpsc::channel(16);
        (ChanListener { rx }, tx)
    }

    async fn dial(tx: &mpsc::Sender<io::Result<PipeConn>>, payload: &[u8]) -> DuplexStream {
        let (pipe, mut client) = PipeConn::pair();
        client.write_all(payload).await.unwrap();
        tx.send(Ok(pipe)).await.unwrap();
        client
    }

    async fn read_all<S: Connection>(mut conn: MuxConn<S>) -> Vec<u8> {
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_first_registered_route_wins() {
        let (root, tx) = chan_listener();
        let mut mux = Mux::new(root);
        let first = mux.route([prefix(["GET "])]);
        let second = mux.route([any()]);
        let handle = mux.handle();
        let serving = tokio::spawn(mux.serve());

        let client = dial(&tx, b"GET / HTTP/1.1\r\n").await;
        drop(client);
        let conn = first.accept().await.unwrap();
        assert_eq!(read_all(conn).await, b"GET / HTTP/1.1\r\n");

        let client = dial(&tx, b"SSH-2.0\r\n").await;
        drop(client);
        let conn = second.accept().await.unwrap();
        assert_eq!(read_all(conn).await, b"SSH-2.0\r\n");

        handle.close();
        assert!(serving.await.unwrap().is_ok());
        assert!(matches!(first.accept().await, Err(MuxError::ListenerClosed)));
        assert!(matches!(second.accept().await, Err(MuxError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_unmatched_connection_is_closed_and_reported() {
        let (root, tx) = chan_listener();
        let mut mux = Mux::new(root);
        let _only = mux.route([prefix(["GET "])]);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        mux.handle_error(move |err| {
            let _ = seen_tx.send(err.to_string());
            true
        });
        let handle = mux.handle();
        let serving = tokio::spawn(mux.serve());

        let mut client = dial(&tx, b"SSH-2.0\r\n").await;
        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(
            seen,
            "mux: connection 10.1.1.1:4000 not matched by any matcher"
        );
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);

        handle.close();
        assert!(serving.await.unwrap().is_ok());
        assert_eq!(handle.stats().connections_unmatched.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_refused_error_stops_serving() {
        let (root, tx) = chan_listener();
        let mut mux = Mux::new(root);
        let only = mux.route([prefix(["GET "])]);
        mux.handle_error(|_| false);
        let serving = tokio::spawn(mux.serve());

        let _client = dial(&tx, b"SSH-2.0\r\n").await;
        let result = serving.await.unwrap();
        assert!(matches!(result, Err(MuxError::NotMatched { .. })));
        assert!(matches!(only.accept().await, Err(MuxError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_temporary_accept_error_is_survived() {
        let (root, tx) = chan_listener();
        let mut mux = Mux::new(root);
        let route = mux.route([any()]);
        let handle = mux.handle();
        let serving = tokio::spawn(mux.serve());

        tx.send(Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
            .await
            .unwrap();
        let client = dial(&tx, b"hi").await;
        drop(client);
        assert_eq!(read_all(route.accept().await.unwrap()).await, b"hi");

        // Dropping the feed turns into a permanent accept error.
        drop(tx);
        let result = serving.await.unwrap();
        assert!(matches!(result, Err(MuxError::Accept(_))));
        assert_eq!(handle.stats().accept_errors.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_panicking_matcher_only_loses_its_connection() {
        let (root, tx) = chan_listener();
        let mut mux = Mux::new(root);
        let boom = mux.route([from_fn(1, |b: &[u8]| {
            if b == b"!" {
                panic!("matcher bug");
            }
            false
        })]);
        let rest = mux.route([any()]);
        let handle = mux.handle();
        let serving = tokio::spawn(mux.serve());

        let _bad = dial(&tx, b"!").await;
        let good = dial(&tx, b"ok").await;
        drop(good);
        assert_eq!(read_all(rest.accept().await.unwrap()).await, b"ok");

        handle.close();
        assert!(serving.await.unwrap().is_ok());
        assert!(matches!(boom.accept().await, Err(MuxError::ListenerClosed)));
        assert_eq!(handle.stats().connections_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_sniff_timeout_counts_as_no_match() {
        let (root, tx) = chan_listener();
        let config = MuxConfig::new().with_sniff_timeout(Duration::from_millis(50));
        let mut mux = Mux::with_config(root, config);
        let _wants_more = mux.route([prefix(["GET "])]);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        mux.handle_error(move |err| {
            let _ = seen_tx.send(matches!(err, MuxError::NotMatched { .. }));
            true
        });
        let handle = mux.handle();
        let serving = tokio::spawn(mux.serve());

        // Stays open without sending the rest of the method.
        let _client = dial(&tx, b"GE").await;
        assert!(seen_rx.recv().await.unwrap());

        handle.close();
        assert!(serving.await.unwrap().is_ok());
    }
}
