//! Egress transports.
//!
//! Every policy name resolves to an [`Outbound`]: `Direct` dials the
//! target itself, `Reject` refuses, and the proxy variants run their
//! client handshake on a connection to an upstream proxy first.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::address::Address;
use crate::error::{ProxyError, Result};
use crate::http;
use crate::socks::client::{self, ClientAuth};

/// Default dialer timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a proxy handshake once the socket is connected.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound a proxy negotiation so a stalled upstream cannot hang the dial.
async fn negotiate<F, T>(future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(NEGOTIATION_TIMEOUT, future).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::HostUnreachable(
            "proxy negotiation timed out".to_string(),
        )),
    }
}

/// A byte stream plus the socket queries negotiation needs.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl ProxyStream for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl ProxyStream for Box<dyn ProxyStream> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }
}

/// Outbound connection interface.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Establish a TCP connection to the given address.
    async fn dial(&self, addr: &Address) -> Result<Box<dyn ProxyStream>>;
}

/// Connect to a host:port with a timeout, mapping failures to
/// host-unreachable semantics.
async fn connect_tcp(target: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::HostUnreachable(format!("{}: {}", target, e))),
        Err(_) => Err(ProxyError::HostUnreachable(format!(
            "{}: connect timed out",
            target
        ))),
    }
}

/// Direct connection to the destination.
#[derive(Debug, Clone)]
pub struct Direct {
    timeout: Duration,
}

impl Direct {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Outbound for Direct {
    async fn dial(&self, addr: &Address) -> Result<Box<dyn ProxyStream>> {
        addr.ensure_connectable()?;
        let stream = connect_tcp(&addr.to_string(), self.timeout).await?;
        Ok(Box::new(stream))
    }
}

/// Refuses every connection.
#[derive(Debug, Clone, Default)]
pub struct Reject;

impl Reject {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Outbound for Reject {
    async fn dial(&self, addr: &Address) -> Result<Box<dyn ProxyStream>> {
        Err(ProxyError::Rejected(addr.to_string()))
    }
}

/// Upstream SOCKS5 proxy.
pub struct Socks5Proxy {
    proxy_addr: String,
    auth: Option<ClientAuth>,
    timeout: Duration,
}

impl Socks5Proxy {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            auth: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_auth(
        proxy_addr: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            proxy_addr: proxy_addr.into(),
            auth: Some(ClientAuth::new(username, password)?),
            timeout: DEFAULT_DIAL_TIMEOUT,
        })
    }
}

#[async_trait]
impl Outbound for Socks5Proxy {
    async fn dial(&self, addr: &Address) -> Result<Box<dyn ProxyStream>> {
        let mut stream = connect_tcp(&self.proxy_addr, self.timeout).await?;
        negotiate(client::handshake(&mut stream, addr, self.auth.as_ref())).await?;
        Ok(Box::new(stream))
    }
}

/// Upstream HTTP proxy, tunneling through CONNECT.
pub struct HttpConnectProxy {
    proxy_addr: String,
    /// Precomputed `Proxy-Authorization` value.
    proxy_authorization: Option<String>,
    timeout: Duration,
}

impl HttpConnectProxy {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            proxy_authorization: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_auth(
        proxy_addr: impl Into<String>,
        username: &str,
        password: &str,
    ) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            proxy_authorization: Some(http::basic_auth(username, password)),
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

#[async_trait]
impl Outbound for HttpConnectProxy {
    async fn dial(&self, addr: &Address) -> Result<Box<dyn ProxyStream>> {
        let mut stream = connect_tcp(&self.proxy_addr, self.timeout).await?;
        let leftover = negotiate(http::connect::handshake(
            &mut stream,
            addr,
            self.proxy_authorization.as_deref(),
        ))
        .await?;
        if leftover.is_empty() {
            Ok(Box::new(stream))
        } else {
            Ok(Box::new(PrefixedStream::new(stream, leftover)))
        }
    }
}

/// A stream with bytes that must be read before the underlying socket, as
/// when a proxy pipelines tunnel data behind its response head.
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Vec<u8>,
    pos: usize,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            pos: 0,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
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

impl<S: ProxyStream> ProxyStream for PrefixedStream<S> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}
