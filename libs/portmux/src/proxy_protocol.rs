//! PROXY protocol header parsing and generation.
//!
//! An intermediary in front of the mux may prepend a PROXY header carrying
//! the client's original addresses. Two encodings exist:
//!
//! - v1, a single CRLF-terminated text line:
//!   `PROXY <TCP4|TCP6|UNKNOWN> <src ip> <dst ip> <src port> <dst port>\r\n`
//! - v2, a binary block:
//!   - 12 bytes signature
//!   - 1 byte version and command
//!   - 1 byte address family and transport protocol
//!   - 2 bytes address length
//!   - variable: addresses and ports
//!
//! Parsing is incremental: [`parse`] reports [`Parsed::Incomplete`] until it
//! has seen enough bytes to decide, so it can be driven from a stream that
//! delivers the header in pieces.

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyHeaderError;

/// Default upper bound on bytes read while looking for a header.
pub const DEFAULT_MAX_HEADER_LEN: usize = 1024;

/// Tag opening a v1 header.
const V1_TAG: &[u8] = b"PROXY ";

/// Longest legal v1 line, CRLF included.
const V1_MAX_LINE_LEN: usize = 107;

/// PROXY protocol v2 signature (12 bytes).
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Signature + version/command + family + length.
const V2_FIXED_LEN: usize = 16;

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command (health checks from the intermediary itself).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Addresses conveyed by a PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Source (client) address.
    pub src_addr: SocketAddr,
    /// Destination address as seen by the intermediary.
    pub dst_addr: SocketAddr,
}

/// Outcome of looking for a header at the start of some bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    /// The bytes do not start with a PROXY header.
    Absent,
    /// The bytes are a consistent, unfinished header.
    Incomplete,
    /// A complete header of `len` bytes. `header` is `None` when the header
    /// carries no usable addresses (`UNKNOWN`, `LOCAL`, unsupported family).
    Complete {
        header: Option<ProxyHeader>,
        len: usize,
    },
}

impl ProxyHeader {
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self { src_addr, dst_addr }
    }

    /// Render the header as a v1 text line.
    pub fn encode_v1(&self) -> Vec<u8> {
        let family = match (self.src_addr, self.dst_addr) {
            (SocketAddr::V4(_), SocketAddr::V4(_)) => "TCP4",
            (SocketAddr::V6(_), SocketAddr::V6(_)) => "TCP6",
            _ => return b"PROXY UNKNOWN\r\n".to_vec(),
        };
        format!(
            "PROXY {} {} {} {} {}\r\n",
            family,
            self.src_addr.ip(),
            self.dst_addr.ip(),
            self.src_addr.port(),
            self.dst_addr.port()
        )
        .into_bytes()
    }

    /// Render the header as a v2 binary block. Both addresses must share a
    /// family; v2 has no `UNKNOWN` form for a mixed pair.
    pub fn encode_v2(&self) -> io::Result<Vec<u8>> {
        match (self.src_addr.ip(), self.dst_addr.ip()) {
            (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => self.encode_v2_inet(src_ip, dst_ip),
            (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => self.encode_v2_inet6(src_ip, dst_ip),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "PROXY v2 header needs matching address families",
            )),
        }
    }

    fn encode_v2_inet(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(V2_FIXED_LEN + IPV4_ADDR_LEN as usize);
        buf.write_all(&PROXY_V2_SIGNATURE)?;
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(AF_INET | TRANSPORT_STREAM);
        buf.write_all(&IPV4_ADDR_LEN.to_be_bytes())?;
        buf.write_all(&src_ip.octets())?;
        buf.write_all(&dst_ip.octets())?;
        buf.write_all(&self.src_addr.port().to_be_bytes())?;
        buf.write_all(&self.dst_addr.port().to_be_bytes())?;
        Ok(buf)
    }

    fn encode_v2_inet6(&self, src_ip: Ipv6Addr, dst_ip: Ipv6Addr) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(V2_FIXED_LEN + IPV6_ADDR_LEN as usize);
        buf.write_all(&PROXY_V2_SIGNATURE)?;
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(AF_INET6 | TRANSPORT_STREAM);
        buf.write_all(&IPV6_ADDR_LEN.to_be_bytes())?;
        buf.write_all(&src_ip.octets())?;
        buf.write_all(&dst_ip.octets())?;
        buf.write_all(&self.src_addr.port().to_be_bytes())?;
        buf.write_all(&self.dst_addr.port().to_be_bytes())?;
        Ok(buf)
    }
}

/// True if `data` is consistent with the start of `tag` (byte by byte).
fn agrees_with(data: &[u8], tag: &[u8]) -> bool {
    let n = data.len().min(tag.len());
    data[..n] == tag[..n]
}

/// Look for a PROXY header at the start of `data`.
pub fn parse(data: &[u8]) -> Result<Parsed, ProxyHeaderError> {
    if data.is_empty() {
        return Ok(Parsed::Incomplete);
    }
    if agrees_with(data, V1_TAG) {
        if data.len() < V1_TAG.len() {
            return Ok(Parsed::Incomplete);
        }
        return parse_v1(data);
    }
    if agrees_with(data, &PROXY_V2_SIGNATURE) {
        if data.len() < PROXY_V2_SIGNATURE.len() {
            return Ok(Parsed::Incomplete);
        }
        return parse_v2(data);
    }
    Ok(Parsed::Absent)
}

/// Whether `data` already commits to a header, so that running out of input
/// is a truncation rather than "no header".
fn committed(data: &[u8]) -> bool {
    data.starts_with(V1_TAG) || data.starts_with(&PROXY_V2_SIGNATURE)
}

fn parse_v1(data: &[u8]) -> Result<Parsed, ProxyHeaderError> {
    let window = &data[..data.len().min(V1_MAX_LINE_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        if data.len() >= V1_MAX_LINE_LEN {
            return Err(ProxyHeaderError::TooLong {
                limit: V1_MAX_LINE_LEN,
            });
        }
        return Ok(Parsed::Incomplete);
    };

    let line = std::str::from_utf8(&data[..end])
        .map_err(|_| ProxyHeaderError::InvalidLine(String::from_utf8_lossy(&data[..end]).into()))?;
    let len = end + 2;

    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() < 2 {
        return Err(ProxyHeaderError::InvalidLine(line.to_string()));
    }

    let v6 = match parts[1] {
        "UNKNOWN" => return Ok(Parsed::Complete { header: None, len }),
        "TCP4" => false,
        "TCP6" => true,
        other => return Err(ProxyHeaderError::UnknownFamily(other.to_string())),
    };

    if parts.len() != 6 {
        return Err(ProxyHeaderError::InvalidLine(line.to_string()));
    }

    let src_ip = parse_ip(parts[2], v6)?;
    let dst_ip = parse_ip(parts[3], v6)?;
    let src_port = parse_port(parts[4])?;
    let dst_port = parse_port(parts[5])?;

    Ok(Parsed::Complete {
        header: Some(ProxyHeader::new(
            SocketAddr::new(src_ip, src_port),
            SocketAddr::new(dst_ip, dst_port),
        )),
        len,
    })
}

fn parse_ip(field: &str, v6: bool) -> Result<IpAddr, ProxyHeaderError> {
    let ip: IpAddr = field
        .parse()
        .map_err(|_| ProxyHeaderError::InvalidAddress(field.to_string()))?;
    if ip.is_ipv6() != v6 {
        return Err(ProxyHeaderError::InvalidAddress(field.to_string()));
    }
    Ok(ip)
}

fn parse_port(field: &str) -> Result<u16, ProxyHeaderError> {
    // u16::from_str accepts a leading '+', the protocol does not.
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyHeaderError::InvalidPort(field.to_string()));
    }
    field
        .parse()
        .map_err(|_| ProxyHeaderError::InvalidPort(field.to_string()))
}

fn parse_v2(data: &[u8]) -> Result<Parsed, ProxyHeaderError> {
    if data.len() < V2_FIXED_LEN {
        return Ok(Parsed::Incomplete);
    }

    let version_command = data[12];
    let family_protocol = data[13];
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let len = V2_FIXED_LEN + addr_len;

    if version_command != VERSION_COMMAND_PROXY && version_command != VERSION_COMMAND_LOCAL {
        return Err(ProxyHeaderError::UnsupportedVersion(version_command));
    }

    if data.len() < len {
        return Ok(Parsed::Incomplete);
    }

    if version_command == VERSION_COMMAND_LOCAL {
        return Ok(Parsed::Complete { header: None, len });
    }

    let block = &data[V2_FIXED_LEN..len];
    let header = match family_protocol {
        x if x == (AF_INET | TRANSPORT_STREAM) => {
            if addr_len < IPV4_ADDR_LEN as usize {
                return Err(ProxyHeaderError::Truncated);
            }
            let src_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
            let dst_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
            let src_port = u16::from_be_bytes([block[8], block[9]]);
            let dst_port = u16::from_be_bytes([block[10], block[11]]);
            Some(ProxyHeader::new(
                SocketAddr::new(IpAddr::V4(src_ip), src_port),
                SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            ))
        }
        x if x == (AF_INET6 | TRANSPORT_STREAM) => {
            if addr_len < IPV6_ADDR_LEN as usize {
                return Err(ProxyHeaderError::Truncated);
            }
            let mut src_octets = [0u8; 16];
            let mut dst_octets = [0u8; 16];
            src_octets.copy_from_slice(&block[..16]);
            dst_octets.copy_from_slice(&block[16..32]);
            let src_port = u16::from_be_bytes([block[32], block[33]]);
            let dst_port = u16::from_be_bytes([block[34], block[35]]);
            Some(ProxyHeader::new(
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
            ))
        }
        // UNSPEC, UDP and unix sockets: consume, keep the real addresses.
        _ => None,
    };

    Ok(Parsed::Complete { header, len })
}

/// Read from `reader` until a header is found, ruled out, or `max_len`
/// bytes have been seen.
///
/// Bytes are read in whatever chunks the reader yields; the caller is
/// expected to hand in a replaying view so nothing read here is lost.
/// A mismatch on the leading tag returns [`Parsed::Absent`] immediately.
pub async fn read_header<R>(reader: &mut R, max_len: usize) -> Result<Parsed, ProxyHeaderError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; max_len];
    let mut filled = 0;

    loop {
        match parse(&buf[..filled])? {
            Parsed::Incomplete => {}
            done => return Ok(done),
        }

        if filled == max_len {
            return Err(ProxyHeaderError::TooLong { limit: max_len });
        }

        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return if committed(&buf[..filled]) {
                Err(ProxyHeaderError::Truncated)
            } else {
                Ok(Parsed::Absent)
            };
        }
        filled += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(src: &str, dst: &str) -> ProxyHeader {
        ProxyHeader::new(src.parse().unwrap(), dst.parse().unwrap())
    }

    #[test]
    fn test_parse_v1_tcp4() {
        let data = b"PROXY TCP4 192.168.1.1 192.168.1.2 1234 5678\r\nGET / HTTP/1.1\r\n";
        let parsed = parse(data).unwrap();
        assert_eq!(
            parsed,
            Parsed::Complete {
                header: Some(header("192.168.1.1:1234", "192.168.1.2:5678")),
                len: 46,
            }
        );
    }

    #[test]
    fn test_parse_v1_tcp6() {
        let data = b"PROXY TCP6 2001:db8::1 2001:db8::2 40000 443\r\n";
        match parse(data).unwrap() {
            Parsed::Complete { header: Some(h), len } => {
                assert_eq!(h, header("[2001:db8::1]:40000", "[2001:db8::2]:443"));
                assert_eq!(len, data.len());
            }
            other => panic!("Expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_v1_unknown_consumes_line() {
        let data = b"PROXY UNKNOWN ffff::1 ffff::2 1 2\r\nrest";
        assert_eq!(
            parse(data).unwrap(),
            Parsed::Complete {
                header: None,
                len: data.len() - 4,
            }
        );
    }

    #[test]
    fn test_parse_absent_on_first_mismatch() {
        assert_eq!(parse(b"GET / HTTP/1.1\r\n").unwrap(), Parsed::Absent);
        assert_eq!(parse(b"PROXX").unwrap(), Parsed::Absent);
        assert_eq!(parse(b"P").unwrap(), Parsed::Incomplete);
        assert_eq!(parse(b"PROXY TCP4 1.2.3.4").unwrap(), Parsed::Incomplete);
    }

    #[test]
    fn test_parse_v1_errors() {
        assert!(matches!(
            parse(b"PROXY UDP4 1.1.1.1 2.2.2.2 1 2\r\n"),
            Err(ProxyHeaderError::UnknownFamily(f)) if f == "UDP4"
        ));
        assert!(matches!(
            parse(b"PROXY TCP4 1.1.1.1 2.2.2.2 1\r\n"),
            Err(ProxyHeaderError::InvalidLine(_))
        ));
        assert!(matches!(
            parse(b"PROXY TCP4 1.1.1 2.2.2.2 1 2\r\n"),
            Err(ProxyHeaderError::InvalidAddress(a)) if a == "1.1.1"
        ));
        assert!(matches!(
            parse(b"PROXY TCP4 ::1 2.2.2.2 1 2\r\n"),
            Err(ProxyHeaderError::InvalidAddress(_))
        ));
        assert!(matches!(
            parse(b"PROXY TCP4 1.1.1.1 2.2.2.2 70000 2\r\n"),
            Err(ProxyHeaderError::InvalidPort(p)) if p == "70000"
        ));
        assert!(matches!(
            parse(b"PROXY TCP4 1.1.1.1 2.2.2.2 +1 2\r\n"),
            Err(ProxyHeaderError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_parse_v1_line_too_long() {
        let mut data = b"PROXY TCP4 ".to_vec();
        data.extend(std::iter::repeat(b'1').take(200));
        assert!(matches!(
            parse(&data),
            Err(ProxyHeaderError::TooLong { .. })
        ));
    }

    #[test]
    fn test_v2_roundtrip_ipv4() {
        let h = header("192.168.1.1:12345", "10.0.0.1:443");
        let mut encoded = h.encode_v2().unwrap();
        assert_eq!(encoded.len(), 28);
        assert_eq!(&encoded[..12], &PROXY_V2_SIGNATURE);
        encoded.extend_from_slice(b"payload");

        assert_eq!(
            parse(&encoded).unwrap(),
            Parsed::Complete {
                header: Some(h),
                len: 28
            }
        );
    }

    #[test]
    fn test_v2_roundtrip_ipv6() {
        let h = header("[2001:db8::1]:12345", "[2001:db8::2]:443");
        let encoded = h.encode_v2().unwrap();
        assert_eq!(encoded.len(), 52);
        assert_eq!(encoded[13], AF_INET6 | TRANSPORT_STREAM);
        assert_eq!(
            parse(&encoded).unwrap(),
            Parsed::Complete {
                header: Some(h),
                len: 52
            }
        );
    }

    #[test]
    fn test_v2_local_and_partial() {
        let mut local = PROXY_V2_SIGNATURE.to_vec();
        local.extend_from_slice(&[VERSION_COMMAND_LOCAL, 0x00, 0x00, 0x00]);
        assert_eq!(
            parse(&local).unwrap(),
            Parsed::Complete {
                header: None,
                len: 16
            }
        );

        let encoded = header("1.2.3.4:1", "5.6.7.8:2").encode_v2().unwrap();
        assert_eq!(parse(&encoded[..20]).unwrap(), Parsed::Incomplete);

        let mut bad = encoded.clone();
        bad[12] = 0x31;
        assert!(matches!(
            parse(&bad),
            Err(ProxyHeaderError::UnsupportedVersion(0x31))
        ));
    }

    #[test]
    fn test_encode_v1_matches_parser() {
        let h = header("192.168.1.1:1234", "192.168.1.2:5678");
        let line = h.encode_v1();
        assert_eq!(line, b"PROXY TCP4 192.168.1.1 192.168.1.2 1234 5678\r\n");
    }

    #[test]
    fn test_mixed_families() {
        let h = header("192.168.1.1:1234", "[2001:db8::2]:443");
        assert_eq!(h.encode_v1(), b"PROXY UNKNOWN\r\n");
        let err = h.encode_v2().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_read_header_across_partial_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for piece in [&b"PRO"[..], b"XY TCP4 10.0.0.1 ", b"10.0.0.2 1 2\r", b"\npayload"] {
                client.write_all(piece).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let parsed = read_header(&mut server, DEFAULT_MAX_HEADER_LEN).await.unwrap();
        writer.await.unwrap();
        assert_eq!(
            parsed,
            Parsed::Complete {
                header: Some(header("10.0.0.1:1", "10.0.0.2:2")),
                len: 34,
            }
        );
    }

    #[tokio::test]
    async fn test_read_header_eof() {
        let mut stream: &[u8] = b"PRO";
        assert_eq!(read_header(&mut stream, 1024).await.unwrap(), Parsed::Absent);

        let mut stream: &[u8] = b"PROXY TCP4 1.1.1.1";
        assert!(matches!(
            read_header(&mut stream, 1024).await,
            Err(ProxyHeaderError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_read_header_limit() {
        let mut stream: &[u8] = b"PROXY TCP4 ";
        assert!(matches!(
            read_header(&mut stream, 8).await,
            Err(ProxyHeaderError::TooLong { limit: 8 })
        ));
    }
}
