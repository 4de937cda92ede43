//! The raw transport layer: dialing TCP and Unix-domain sockets, and the
//! polymorphic byte-stream the protocol layers drive.
//!
//! The pool and connections only ever see [`NetworkStream`] trait objects,
//! so alternative backends (or test doubles) can be swapped in through
//! [`NetworkBackend`].

mod tls;

pub use self::tls::{default_tls_config, TlsInfo, TlsParams};

pub(crate) use self::tls::alpn_protocols;

use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

#[cfg(unix)]
use std::path::Path;

use async_trait::async_trait;
use log::trace;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpSocket, TcpStream},
};

use crate::error::{Error, Result};

/// A socket option applied before connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// `TCP_NODELAY`.
    NoDelay(bool),
    /// `SO_KEEPALIVE`.
    KeepAlive(bool),
    /// `SO_RCVBUF`.
    RecvBuffer(usize),
    /// `SO_SNDBUF`.
    SendBuffer(usize),
}

/// A live byte transport with an optional TLS-upgrade capability.
#[async_trait]
pub trait NetworkStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Wrap this stream in TLS, performing the handshake.
    ///
    /// The returned stream reports negotiated TLS details through
    /// [`NetworkStream::tls_info`].
    async fn start_tls(self: Box<Self>, tls: TlsParams) -> Result<Box<dyn NetworkStream>>;

    /// TLS details, or `None` on a plaintext stream.
    fn tls_info(&self) -> Option<TlsInfo> {
        None
    }

    /// The peer address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Dials transports on behalf of the pool.
#[async_trait]
pub trait NetworkBackend: Send + Sync + fmt::Debug {
    /// Open a TCP connection.
    async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<IpAddr>,
        socket_options: &[SocketOption],
    ) -> Result<Box<dyn NetworkStream>>;

    /// Open a Unix-domain socket connection.
    #[cfg(unix)]
    async fn connect_unix(
        &self,
        path: &Path,
        timeout: Option<Duration>,
        socket_options: &[SocketOption],
    ) -> Result<Box<dyn NetworkStream>>;
}

/// The default backend, dialing with `tokio::net`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioBackend;

#[async_trait]
impl NetworkBackend for TokioBackend {
    async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<IpAddr>,
        socket_options: &[SocketOption],
    ) -> Result<Box<dyn NetworkStream>> {
        let attempt = connect_tcp_inner(host, port, local_address, socket_options);
        let stream = match timeout {
            Some(duration) => tokio::time::timeout(duration, attempt)
                .await
                .map_err(|_| Error::connect_timeout())??,
            None => attempt.await?,
        };
        Ok(Box::new(Tcp(stream)))
    }

    #[cfg(unix)]
    async fn connect_unix(
        &self,
        path: &Path,
        timeout: Option<Duration>,
        _socket_options: &[SocketOption],
    ) -> Result<Box<dyn NetworkStream>> {
        trace!("connecting unix socket {}", path.display());
        let attempt = tokio::net::UnixStream::connect(path);
        let stream = match timeout {
            Some(duration) => tokio::time::timeout(duration, attempt)
                .await
                .map_err(|_| Error::connect_timeout())?
                .map_err(Error::connect)?,
            None => attempt.await.map_err(Error::connect)?,
        };
        Ok(Box::new(Unix(stream)))
    }
}

async fn connect_tcp_inner(
    host: &str,
    port: u16,
    local_address: Option<IpAddr>,
    socket_options: &[SocketOption],
) -> Result<TcpStream> {
    trace!("connecting tcp {host}:{port}");
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(Error::connect)?;

    let mut last_err = None;
    for addr in addrs {
        // A bound local address pins the address family.
        if let Some(local) = local_address {
            if local.is_ipv4() != addr.is_ipv4() {
                continue;
            }
        }
        match connect_addr(addr, local_address, socket_options).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::connect(format!("no usable addresses resolved for {host}:{port}"))
    }))
}

async fn connect_addr(
    addr: SocketAddr,
    local_address: Option<IpAddr>,
    socket_options: &[SocketOption],
) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::connect)?;
    for option in socket_options {
        apply_socket_option(&socket, option).map_err(Error::connect)?;
    }
    if let Some(local) = local_address {
        socket
            .bind(&SocketAddr::new(local, 0).into())
            .map_err(Error::connect)?;
    }
    socket.set_nonblocking(true).map_err(Error::connect)?;

    let socket = TcpSocket::from_std_stream(socket.into());
    socket.connect(addr).await.map_err(Error::connect)
}

fn apply_socket_option(socket: &Socket, option: &SocketOption) -> io::Result<()> {
    match *option {
        SocketOption::NoDelay(on) => socket.set_nodelay(on),
        SocketOption::KeepAlive(on) => socket.set_keepalive(on),
        SocketOption::RecvBuffer(size) => socket.set_recv_buffer_size(size),
        SocketOption::SendBuffer(size) => socket.set_send_buffer_size(size),
    }
}

// ===== stream wrappers =====

/// Replays bytes that were read past a message boundary before handing
/// the stream to its next owner.
pub(crate) struct Rewind {
    prefix: bytes::Bytes,
    inner: Box<dyn NetworkStream>,
}

impl Rewind {
    pub(crate) fn new(prefix: bytes::Bytes, inner: Box<dyn NetworkStream>) -> Rewind {
        Rewind { prefix, inner }
    }
}

impl AsyncRead for Rewind {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let replay = self.prefix.split_to(n);
            buf.put_slice(&replay);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl NetworkStream for Rewind {
    async fn start_tls(self: Box<Self>, tls: TlsParams) -> Result<Box<dyn NetworkStream>> {
        let io: Box<dyn NetworkStream> = self;
        tls::handshake(io, tls).await
    }

    fn tls_info(&self) -> Option<TlsInfo> {
        self.inner.tls_info()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}

struct Tcp(TcpStream);

impl AsyncRead for Tcp {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tcp {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

#[async_trait]
impl NetworkStream for Tcp {
    async fn start_tls(self: Box<Self>, tls: TlsParams) -> Result<Box<dyn NetworkStream>> {
        let io: Box<dyn NetworkStream> = self;
        tls::handshake(io, tls).await
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.0.peer_addr().ok()
    }
}

#[cfg(unix)]
struct Unix(tokio::net::UnixStream);

#[cfg(unix)]
impl AsyncRead for Unix {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

#[cfg(unix)]
impl AsyncWrite for Unix {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

#[cfg(unix)]
#[async_trait]
impl NetworkStream for Unix {
    async fn start_tls(self: Box<Self>, tls: TlsParams) -> Result<Box<dyn NetworkStream>> {
        let io: Box<dyn NetworkStream> = self;
        tls::handshake(io, tls).await
    }
}
