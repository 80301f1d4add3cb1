//! portmux: serve several protocols on one listening socket.
//!
//! A [`Mux`] accepts connections from a root [`Listener`], peeks at the
//! first bytes of each one with the matchers registered per route, and hands
//! the connection, unread, to the first route that wants it. Each route is
//! consumed through its own [`MuxListener`], so existing servers can run on
//! top of it unchanged.
//!
//! ```no_run
//! use portmux::{matcher, Mux};
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let root = TcpListener::bind("127.0.0.1:8080").await?;
//! let mut mux = Mux::new(root);
//! let http = mux.route([matcher::http1_fast(&[])]);
//! let tls = mux.route([matcher::tls()]);
//! let other = mux.route([matcher::any()]);
//!
//! tokio::spawn(async move {
//!     while let Ok(conn) = http.accept().await {
//!         // serve HTTP on `conn`
//!         drop(conn);
//!     }
//! });
//! # drop((tls, other));
//! mux.serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod listener;
pub mod matcher;
pub mod mux;
pub mod patricia;
pub mod proxy_protocol;

pub use buffer::ReplayBuffer;
pub use config::{MuxConfig, ProxyErrorAction, ProxyProtocol, DEFAULT_QUEUE_CAPACITY};
pub use conn::{Connection, MuxConn, Sniffer};
pub use error::{MuxError, ProxyHeaderError};
pub use listener::{Listener, MuxListener};
pub use matcher::{Matcher, MatcherRef};
pub use mux::{ErrorHandler, Mux, MuxHandle, MuxStats};
pub use patricia::{MatchMode, PatriciaMatcher};
pub use proxy_protocol::ProxyHeader;
