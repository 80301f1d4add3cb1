//! Sniffable connections.
//!
//! A [`MuxConn`] wraps one accepted connection together with a
//! [`ReplayBuffer`]. While the mux is matching, every byte pulled from the
//! socket through a [`Sniffer`] is captured, and each new sniffer starts
//! again from the first captured byte. Once dispatch is over the buffer
//! stops recording; the owner then reads the captured bytes exactly once,
//! followed by the live socket.

use std::io::{self, IoSlice, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::buffer::ReplayBuffer;
use crate::error::ProxyHeaderError;
use crate::proxy_protocol::{self, Parsed, ProxyHeader};

/// A bidirectional byte stream with addresses, as produced by a listener.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Address of the remote peer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Address of the local end.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Connection for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

/// A replaying read view handed to matchers.
///
/// Reads are served from the bytes already captured for this connection
/// first; once those run out they fall through to the socket, and whatever
/// arrives is captured as well so the next view sees it too.
pub struct Sniffer<'a> {
    buf: &'a mut ReplayBuffer,
    source: &'a mut (dyn AsyncRead + Send + Unpin),
}

impl<'a> Sniffer<'a> {
    /// Every byte captured so far, independent of this view's position.
    pub fn captured(&self) -> &[u8] {
        self.buf.as_slice()
    }
}

impl AsyncRead for Sniffer<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.buf.remaining() > 0 {
            let n = this.buf.remaining().min(out.remaining());
            out.put_slice(&this.buf.unread()[..n]);
            this.buf.advance(n);
            return Poll::Ready(Ok(()));
        }

        let before = out.filled().len();
        ready!(Pin::new(&mut *this.source).poll_read(cx, out))?;
        let fresh = &out.filled()[before..];
        if this.buf.is_recording() && !fresh.is_empty() {
            this.buf.write_all(fresh)?;
            // This view has already handed these bytes out.
            this.buf.advance(fresh.len());
        }
        Poll::Ready(Ok(()))
    }
}

/// A connection routed by the mux.
///
/// Reads first replay whatever the matchers consumed, in original order and
/// exactly once, then continue on the underlying connection. Writes go
/// straight through.
pub struct MuxConn<S> {
    inner: S,
    buf: ReplayBuffer,
    proxy: Option<ProxyHeader>,
}

impl<S: Connection> MuxConn<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            buf: ReplayBuffer::new(),
            proxy: None,
        }
    }

    /// A fresh view over the connection starting at the first replayable
    /// byte.
    pub(crate) fn sniffer(&mut self) -> Sniffer<'_> {
        self.buf.reset_read();
        Sniffer {
            buf: &mut self.buf,
            source: &mut self.inner,
        }
    }

    /// Rewind after a matcher ran, whatever it returned.
    pub(crate) fn reset(&mut self) {
        self.buf.reset_read();
    }

    /// Leave sniffing mode; subsequent reads drain the capture once.
    pub(crate) fn finish_sniffing(&mut self) {
        self.buf.finish_sniffing();
    }

    /// Look for a PROXY header at the start of the stream.
    ///
    /// A complete header is consumed: later views start right after it and
    /// its addresses (if any) override [`peer_addr`](Self::peer_addr) and
    /// [`local_addr`](Self::local_addr). When no header is present, or on
    /// error, every byte read stays replayable.
    pub(crate) async fn read_proxy_header(
        &mut self,
        max_len: usize,
    ) -> Result<Option<ProxyHeader>, ProxyHeaderError> {
        let parsed = {
            let mut sniffer = self.sniffer();
            proxy_protocol::read_header(&mut sniffer, max_len).await
        };
        self.reset();

        match parsed? {
            Parsed::Complete { header, len } => {
                self.buf.consume_front(len);
                self.proxy = header;
                Ok(header)
            }
            Parsed::Absent | Parsed::Incomplete => Ok(None),
        }
    }

    /// The source address: the PROXY header's if one was accepted,
    /// otherwise the socket's.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.proxy {
            Some(header) => Ok(header.src_addr),
            None => self.inner.peer_addr(),
        }
    }

    /// The destination address: the PROXY header's if one was accepted,
    /// otherwise the socket's.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.proxy {
            Some(header) => Ok(header.dst_addr),
            None => self.inner.local_addr(),
        }
    }

    /// The PROXY header accepted for this connection, if any.
    pub fn proxy_header(&self) -> Option<&ProxyHeader> {
        self.proxy.as_ref()
    }

    /// Bytes captured during matching that have not been read yet.
    pub fn buffered(&self) -> &[u8] {
        if self.buf.is_recording() {
            &[]
        } else {
            self.buf.unread()
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Split into the unread captured bytes and the raw connection. The
    /// caller must deliver the bytes before reading from the connection.
    pub fn into_parts(self) -> (Vec<u8>, S) {
        let pending = self.buffered().to_vec();
        (pending, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MuxConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_recording() && this.buf.remaining() > 0 && out.remaining() > 0 {
            let n = this.buf.remaining().min(out.remaining());
            out.put_slice(&this.buf.unread()[..n]);
            this.buf.advance(n);
            this.buf.release_if_drained();
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MuxConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: Connection> Connection for MuxConn<S> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        MuxConn::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        MuxConn::local_addr(self)
    }
}

impl<S> std::fmt::Debug for MuxConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConn")
            .field("buffered", &self.buf.remaining())
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}
