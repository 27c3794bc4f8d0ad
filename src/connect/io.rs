use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream;

use super::session::SessionStore;

/// 连接底层的原始传输。
pub(super) enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// [`Connector::connect`](super::Connector::connect) 返回的就绪连接。
///
/// 读写直达 socket。TLS 连接上任何非 informational 类的传输错误，
/// 在返回给调用者之前都会先删除该 server name 的缓存会话。
pub struct Conn {
    inner: Inner,
}

enum Inner {
    Plain(Stream),
    Tls(Box<Invalidate<TlsStream<Stream>>>),
}

/// `io` 每次出错都从会话缓存中淘汰 `server_name`。
pub(super) struct Invalidate<T> {
    io: T,
    server_name: String,
    sessions: Arc<SessionStore>,
}

// ===== impl Stream =====

macro_rules! delegate {
    ($this:expr, $io:ident => $call:expr) => {
        match $this {
            Stream::Tcp($io) => $call,
            #[cfg(unix)]
            Stream::Unix($io) => $call,
        }
    };
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self.get_mut(), io => Pin::new(io).poll_read(cx, buf))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self.get_mut(), io => Pin::new(io).poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        delegate!(self.get_mut(), io => Pin::new(io).poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        delegate!(self, io => io.is_write_vectored())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self.get_mut(), io => Pin::new(io).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self.get_mut(), io => Pin::new(io).poll_shutdown(cx))
    }
}

// ===== impl Invalidate =====

impl<T> Invalidate<T> {
    pub(super) fn new(io: T, server_name: String, sessions: Arc<SessionStore>) -> Invalidate<T> {
        Invalidate {
            io,
            server_name,
            sessions,
        }
    }

    fn check<R>(&self, res: Poll<io::Result<R>>) -> Poll<io::Result<R>> {
        if let Poll::Ready(Err(ref err)) = res {
            self.sessions.invalidate(&self.server_name, err);
        }
        res
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Invalidate<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let res = Pin::new(&mut self.io).poll_read(cx, buf);
        self.check(res)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Invalidate<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.io).poll_write(cx, buf);
        self.check(res)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.io).poll_write_vectored(cx, bufs);
        self.check(res)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = Pin::new(&mut self.io).poll_flush(cx);
        self.check(res)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = Pin::new(&mut self.io).poll_shutdown(cx);
        self.check(res)
    }
}

// ===== impl Conn =====

impl Conn {
    pub(super) fn plain(stream: Stream) -> Conn {
        Conn {
            inner: Inner::Plain(stream),
        }
    }

    pub(super) fn tls(stream: Invalidate<TlsStream<Stream>>) -> Conn {
        Conn {
            inner: Inner::Tls(Box::new(stream)),
        }
    }

    /// 连接已加密时返回 true。
    pub fn is_tls(&self) -> bool {
        matches!(self.inner, Inner::Tls(_))
    }

    /// 校验本连接所用的 TLS server name。
    pub fn server_name(&self) -> Option<&str> {
        match self.inner {
            Inner::Plain(_) => None,
            Inner::Tls(ref tls) => Some(&tls.server_name),
        }
    }

    /// 服务端选定的 ALPN 协议（如有）。
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self.inner {
            Inner::Plain(_) => None,
            Inner::Tls(ref tls) => tls.io.get_ref().1.alpn_protocol(),
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().inner {
            Inner::Plain(ref mut io) => Pin::new(io).poll_read(cx, buf),
            Inner::Tls(ref mut io) => Pin::new(&mut **io).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().inner {
            Inner::Plain(ref mut io) => Pin::new(io).poll_write(cx, buf),
            Inner::Tls(ref mut io) => Pin::new(&mut **io).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().inner {
            Inner::Plain(ref mut io) => Pin::new(io).poll_write_vectored(cx, bufs),
            Inner::Tls(ref mut io) => Pin::new(&mut **io).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self.inner {
            Inner::Plain(ref io) => io.is_write_vectored(),
            Inner::Tls(ref io) => io.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner {
            Inner::Plain(ref mut io) => Pin::new(io).poll_flush(cx),
            Inner::Tls(ref mut io) => Pin::new(&mut **io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner {
            Inner::Plain(ref mut io) => Pin::new(io).poll_shutdown(cx),
            Inner::Tls(ref mut io) => Pin::new(&mut **io).poll_shutdown(cx),
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("tls", &self.is_tls())
            .field("server_name", &self.server_name())
            .finish()
    }
}
