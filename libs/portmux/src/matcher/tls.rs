//! TLS handshake detection and SNI (Server Name Indication) matching.
//!
//! [`tls`] only looks at the record header. [`tls_sni`] reads the whole
//! first record and parses the ClientHello for the server name, so several
//! TLS services can share a port and be told apart without terminating TLS.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::{Matcher, MatcherRef};
use crate::conn::Sniffer;

/// Maximum bytes read when sniffing for SNI.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

const RECORD_HANDSHAKE: u8 = 0x16;
const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// What [`parse_sni`] found in the first bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniResult<'a> {
    /// The host name exactly as the client sent it.
    Found(&'a str),
    /// A ClientHello without a host name.
    NoSni,
    NotTls,
    /// A ClientHello that is cut short or inconsistent.
    Malformed,
}

struct Tls;

#[async_trait]
impl Matcher for Tls {
    async fn matches(&self, sniffer: &mut Sniffer<'_>) -> bool {
        let mut header = [0u8; 3];
        if sniffer.read_exact(&mut header).await.is_err() {
            return false;
        }
        // SSL 3.0 through TLS 1.3 record versions.
        header[0] == RECORD_HANDSHAKE && header[1] == 0x03 && header[2] <= 0x04
    }
}

/// Match connections that open with a TLS handshake record.
pub fn tls() -> MatcherRef {
    Arc::new(Tls)
}

struct TlsSni {
    hostnames: HashSet<String>,
    max_bytes: usize,
}

#[async_trait]
impl Matcher for TlsSni {
    async fn matches(&self, sniffer: &mut Sniffer<'_>) -> bool {
        let Ok(record) = read_first_record(sniffer, self.max_bytes).await else {
            return false;
        };

        match parse_sni(&record) {
            SniResult::Found(name) => {
                let name = normalize_hostname(name);
                let hit = self.hostnames.contains(&name);
                debug!(hostname = %name, matched = hit, "SNI extracted");
                hit
            }
            other => {
                debug!(result = ?other, "No usable SNI");
                false
            }
        }
    }
}

/// Match TLS connections whose ClientHello names one of `hostnames`.
///
/// Host names are compared lower-cased with any trailing dot trimmed.
pub fn tls_sni<I, S>(hostnames: I) -> MatcherRef
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Arc::new(TlsSni {
        hostnames: hostnames
            .into_iter()
            .map(|h| normalize_hostname(h.as_ref()))
            .collect(),
        max_bytes: DEFAULT_MAX_SNIFF_BYTES,
    })
}

fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

/// Read the first TLS record, header included, keeping at most `limit`
/// bytes. Anything that is not a handshake record stops after the header.
async fn read_first_record<R>(stream: &mut R, limit: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut record = vec![0u8; RECORD_HEADER_LEN];
    stream.read_exact(&mut record).await?;
    if record[0] != RECORD_HANDSHAKE {
        return Ok(record);
    }

    let body_len = usize::from(u16::from_be_bytes([record[3], record[4]]));
    let len = (RECORD_HEADER_LEN + body_len).min(limit.max(RECORD_HEADER_LEN));
    record.resize(len, 0);
    stream.read_exact(&mut record[RECORD_HEADER_LEN..]).await?;
    Ok(record)
}

/// Extract the server name from a TLS record carrying a ClientHello.
///
/// The record may be cut short after the server name extension; the sniff
/// limit only has to cover the hello up to that point.
pub fn parse_sni(data: &[u8]) -> SniResult<'_> {
    match data.first() {
        None => return SniResult::Malformed,
        Some(&RECORD_HANDSHAKE) => {}
        Some(_) => return SniResult::NotTls,
    }
    if data
        .get(RECORD_HEADER_LEN)
        .is_some_and(|kind| *kind != HANDSHAKE_CLIENT_HELLO)
    {
        return SniResult::NotTls;
    }

    // Record header, then handshake type and 24-bit length.
    let hello = Cursor(data.get(RECORD_HEADER_LEN + 4..).unwrap_or_default());
    let mut extensions = match extensions_of(hello) {
        Ok(extensions) => extensions,
        Err(result) => return result,
    };

    while let Some(kind) = extensions.u16() {
        let Some(body) = extensions.vec16() else {
            return SniResult::Malformed;
        };
        if kind == EXTENSION_SERVER_NAME {
            return server_name(body);
        }
    }
    SniResult::NoSni
}

/// Skip the fixed ClientHello fields and return the extension block.
fn extensions_of(mut hello: Cursor<'_>) -> Result<Cursor<'_>, SniResult<'_>> {
    // legacy_version and random
    hello.take(2 + 32).ok_or(SniResult::Malformed)?;
    hello.vec8().ok_or(SniResult::Malformed)?; // session id
    hello.vec16().ok_or(SniResult::Malformed)?; // cipher suites
    hello.vec8().ok_or(SniResult::Malformed)?; // compression methods

    // Extensions are optional before TLS 1.2.
    let len = hello.u16().ok_or(SniResult::NoSni)?;
    Ok(Cursor(hello.take_at_most(usize::from(len))))
}

/// Pick the host name out of a server_name extension body.
fn server_name(body: &[u8]) -> SniResult<'_> {
    let Some(list) = Cursor(body).vec16() else {
        return SniResult::Malformed;
    };
    let mut list = Cursor(list);
    while let Some(kind) = list.u8() {
        let Some(name) = list.vec16() else {
            return SniResult::Malformed;
        };
        if kind == NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name).map_or(SniResult::Malformed, SniResult::Found);
        }
    }
    SniResult::NoSni
}

/// Reads big-endian integers and length-prefixed vectors off a byte slice.
struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Some(head)
    }

    fn take_at_most(&mut self, n: usize) -> &'a [u8] {
        let (head, rest) = self.0.split_at(n.min(self.0.len()));
        self.0 = rest;
        head
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()?;
        self.take(usize::from(len))
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::conn::tests::PipeConn;
    use crate::conn::MuxConn;

    fn vec16(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    /// A TLS 1.3 style ClientHello record, with a server_name extension for
    /// `server_name` when given.
    fn client_hello(server_name: Option<&[u8]>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = server_name {
            let mut entry = vec![NAME_TYPE_HOST_NAME];
            entry.extend(vec16(name));
            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend(vec16(&vec16(&entry)));
        }
        // supported_versions: TLS 1.3
        extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0x5a; 32]);
        hello.extend_from_slice(&[0x20]);
        hello.extend_from_slice(&[0x11; 32]);
        hello.extend(vec16(&[0x13, 0x01, 0x13, 0x02]));
        hello.extend_from_slice(&[0x01, 0x00]);
        hello.extend(vec16(&extensions));

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend(hello);

        let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
        record.extend(vec16(&handshake));
        record
    }

    async fn run(matcher: &MatcherRef, input: &[u8]) -> bool {
        let (pipe, mut client) = PipeConn::pair();
        client.write_all(input).await.unwrap();
        let mut conn = MuxConn::new(pipe);
        let mut sniffer = conn.sniffer();
        matcher.matches(&mut sniffer).await
    }

    #[test]
    fn test_parse_sni_found() {
        let record = client_hello(Some(b"Example.com"));
        assert_eq!(parse_sni(&record), SniResult::Found("Example.com"));
    }

    #[test]
    fn test_parse_sni_absent() {
        assert_eq!(parse_sni(&client_hello(None)), SniResult::NoSni);
    }

    #[test]
    fn test_parse_sni_not_tls() {
        assert_eq!(
            parse_sni(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            SniResult::NotTls
        );
        let mut alert = client_hello(None);
        alert[5] = 0x02;
        assert_eq!(parse_sni(&alert), SniResult::NotTls);
    }

    #[test]
    fn test_parse_sni_malformed() {
        assert_eq!(parse_sni(&[0x16, 0x03, 0x01]), SniResult::Malformed);
        assert_eq!(parse_sni(&[]), SniResult::Malformed);

        let record = client_hello(Some(b"example.com"));
        // Cut inside the host name.
        assert_eq!(parse_sni(&record[..record.len() - 12]), SniResult::Malformed);

        let record = client_hello(Some(&[0xff, 0xfe]));
        assert_eq!(parse_sni(&record), SniResult::Malformed);
    }

    #[test]
    fn test_parse_sni_stops_after_server_name() {
        // Trailing extensions past the sniff limit do not matter.
        let record = client_hello(Some(b"example.com"));
        let truncated = &record[..record.len() - 7];
        assert_eq!(parse_sni(truncated), SniResult::Found("example.com"));
    }

    #[test]
    fn test_normalize_trailing_dot() {
        assert_eq!(normalize_hostname("EXAMPLE.COM."), "example.com");
    }

    #[tokio::test]
    async fn test_tls_record_header() {
        assert!(run(&tls(), &client_hello(None)).await);
        assert!(!run(&tls(), b"GET / HTTP/1.1\r\n").await);
        assert!(!run(&tls(), &[0x16, 0x03, 0x09]).await);
    }

    #[tokio::test]
    async fn test_tls_sni_matches_configured_host() {
        let record = client_hello(Some(b"Example.com"));
        // The client keeps the connection open: the matcher must stop at the
        // end of the record instead of waiting for more.
        assert!(run(&tls_sni(["example.com."]), &record).await);
        assert!(!run(&tls_sni(["other.example"]), &record).await);
        assert!(!run(&tls_sni(["example.com"]), b"GET / HTTP/1.1\r\n").await);
    }
}
