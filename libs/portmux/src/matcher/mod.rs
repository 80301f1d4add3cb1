//! Connection matchers.
//!
//! A matcher looks at the leading bytes of a connection through a
//! [`Sniffer`] and decides whether the connection belongs to a route. It may
//! read as much as it needs; everything it reads is replayed to the next
//! matcher and, eventually, to the server that accepts the connection.
//!
//! Matchers report only yes or no. An I/O error or early EOF while reading
//! is a "no".
//!
//! ## Bundled matchers
//!
//! - [`any`]: matches every connection without reading.
//! - [`prefix`] / [`exact`]: literal byte strings via a patricia tree.
//! - [`from_fn`]: a synchronous predicate over the first `n` bytes.
//! - [`http1_fast`]: HTTP/1.x request methods.
//! - [`http2`]: the HTTP/2 client connection preface.
//! - [`tls`] / [`tls_sni`]: TLS handshakes, optionally by server name.

mod tls;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::conn::Sniffer;
use crate::patricia::{MatchMode, PatriciaMatcher};

pub use tls::{parse_sni, tls, tls_sni, SniResult, DEFAULT_MAX_SNIFF_BYTES};

/// Decides whether a connection belongs to a route.
#[async_trait]
pub trait Matcher: Send + Sync {
    /// Inspect the connection. Must be safe to call repeatedly against
    /// replays of the same bytes.
    async fn matches(&self, sniffer: &mut Sniffer<'_>) -> bool;
}

/// Shared handle to a matcher, as registered on a route.
pub type MatcherRef = Arc<dyn Matcher>;

/// HTTP/2 client connection preface.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Request methods recognised by [`http1_fast`].
pub const HTTP1_METHODS: &[&str] = &[
    "OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "CONNECT", "PATCH",
];

struct Any;

#[async_trait]
impl Matcher for Any {
    async fn matches(&self, _sniffer: &mut Sniffer<'_>) -> bool {
        true
    }
}

/// Match every connection. Usually registered last as a fallback.
pub fn any() -> MatcherRef {
    Arc::new(Any)
}

struct Literal {
    tree: PatriciaMatcher,
    mode: MatchMode,
}

#[async_trait]
impl Matcher for Literal {
    async fn matches(&self, sniffer: &mut Sniffer<'_>) -> bool {
        match self.mode {
            MatchMode::Prefix => self.tree.match_prefix(sniffer).await,
            MatchMode::Exact => self.tree.match_exact(sniffer).await,
        }
    }
}

/// Match connections whose leading bytes are consistent with one of
/// `candidates`.
pub fn prefix<I, B>(candidates: I) -> MatcherRef
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    Arc::new(Literal {
        tree: PatriciaMatcher::new(candidates),
        mode: MatchMode::Prefix,
    })
}

/// Match connections whose first bytes, up to the longest candidate's
/// length, equal one of `candidates`.
///
/// Only that many bytes are read, so the result depends on the whole set:
/// `exact(["ping"])` accepts `"ping-pong"` because it stops after four
/// bytes, while `exact(["ping", "pingpong"])` reads eight and rejects it.
/// Input that ends early is compared as it is, so `"ping"` followed by EOF
/// matches both.
pub fn exact<I, B>(candidates: I) -> MatcherRef
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    Arc::new(Literal {
        tree: PatriciaMatcher::new(candidates),
        mode: MatchMode::Exact,
    })
}

/// Match HTTP/1.x requests by method, plus any `extra_methods`.
pub fn http1_fast(extra_methods: &[&str]) -> MatcherRef {
    prefix(HTTP1_METHODS.iter().chain(extra_methods.iter()).map(|m| m.as_bytes()))
}

/// Match HTTP/2 connections by their client preface.
pub fn http2() -> MatcherRef {
    exact([HTTP2_PREFACE])
}

struct FnMatcher<F> {
    len: usize,
    predicate: F,
}

#[async_trait]
impl<F> Matcher for FnMatcher<F>
where
    F: Fn(&[u8]) -> bool + Send + Sync + 'static,
{
    async fn matches(&self, sniffer: &mut Sniffer<'_>) -> bool {
        let mut buf = vec![0u8; self.len];
        let mut filled = 0;
        while filled < buf.len() {
            match sniffer.read(&mut buf[filled..]).await {
                Ok(0) | Err(_) => break,
                Ok(n) => filled += n,
            }
        }
        (self.predicate)(&buf[..filled])
    }
}

/// Adapt a predicate over the first `len` bytes of the connection (fewer if
/// the peer closes early).
pub fn from_fn<F>(len: usize, predicate: F) -> MatcherRef
where
    F: Fn(&[u8]) -> bool + Send + Sync + 'static,
{
    Arc::new(FnMatcher { len, predicate })
}
