//! Connection establishment for the primary (HTTP/1.1 + HTTP/2) transport.
//!
//! [`Connector`] is the `tower::Service<Uri>` handed to the pooled hyper
//! client. It dials the origin directly, through an HTTP(S) forward proxy
//! (`CONNECT` for `https` targets) or through a SOCKS tunnel, and then
//! layers TLS on top for `https` targets.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::proxy::{join_host_port, ProxyScheme, ProxyTarget};
use crate::socks;
use crate::tls::{self, ALPN_H2, ALPN_HTTP11};

use http::{HeaderValue, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use log::debug;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const MAX_CONNECT_RESPONSE: usize = 8192;

/// Object-safe stream bound so tunnels can be stacked.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub(crate) type BoxedIo = Box<dyn Io>;

/// How connections leave this process.
#[derive(Debug, Clone)]
pub(crate) enum Route {
    Direct,
    /// HTTP or HTTPS forward proxy.
    Forward(Arc<ProxyTarget>),
    Socks(Arc<ProxyTarget>),
}

impl Route {
    pub(crate) fn from_proxy(proxy: Option<ProxyTarget>) -> Self {
        match proxy {
            None => Route::Direct,
            Some(p) if p.scheme.is_socks() => Route::Socks(Arc::new(p)),
            Some(p) => Route::Forward(Arc::new(p)),
        }
    }

    pub(crate) fn proxy(&self) -> Option<&ProxyTarget> {
        match self {
            Route::Direct => None,
            Route::Forward(p) | Route::Socks(p) => Some(p),
        }
    }
}

#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    route: Route,
    origin_tls: TlsConnector,
    proxy_tls: TlsConnector,
    dial_timeout: Duration,
    tls_handshake_timeout: Duration,
    proxy_dial_timeout: Duration,
    proxy_handshake_timeout: Duration,
    limiter: HostLimiter,
}

impl Connector {
    pub(crate) fn new(config: &ClientConfig, route: Route) -> Result<Self> {
        let alpn: &[&[u8]] = if config.disable_http2 {
            &[ALPN_HTTP11]
        } else {
            &[ALPN_H2, ALPN_HTTP11]
        };
        let origin_tls = TlsConnector::from(Arc::new(tls::client_config(config, alpn)?));
        let proxy_tls = TlsConnector::from(Arc::new(tls::client_config(config, &[ALPN_HTTP11])?));

        Ok(Self {
            inner: Arc::new(ConnectorInner {
                route,
                origin_tls,
                proxy_tls,
                dial_timeout: config.dial_timeout,
                tls_handshake_timeout: config.tls_handshake_timeout,
                proxy_dial_timeout: config.proxy_dial_timeout,
                proxy_handshake_timeout: config.proxy_handshake_timeout,
                limiter: HostLimiter::new(config.max_conns_per_host),
            }),
        })
    }

    pub(crate) fn route(&self) -> &Route {
        &self.inner.route
    }

    async fn connect(self, dst: Uri) -> Result<Conn> {
        let inner = &self.inner;
        let is_https = match dst.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => {
                return Err(Error::Connect(format!(
                    "unsupported scheme {:?}",
                    other.unwrap_or("")
                )))
            }
        };
        let host = dst
            .host()
            .ok_or_else(|| Error::Connect(format!("missing host in {}", dst)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = dst.port_u16().unwrap_or(if is_https { 443 } else { 80 });
        let authority = join_host_port(&host, port);

        let permit = inner.limiter.acquire(&authority).await;

        let (io, proxied): (BoxedIo, bool) = match &inner.route {
            Route::Direct => {
                let tcp = dial(&authority, inner.dial_timeout).await?;
                (Box::new(tcp) as BoxedIo, false)
            }
            Route::Forward(proxy) => {
                let mut io = inner.dial_proxy(proxy).await?;
                if is_https {
                    debug!("CONNECT {} via {}", authority, proxy.addr());
                    let auth = proxy.basic_auth();
                    let tunnel = http_connect(&mut io, &host, port, auth.as_ref());
                    match timeout(inner.proxy_handshake_timeout, tunnel).await {
                        Ok(res) => res?,
                        Err(_) => return Err(Error::Timeout),
                    }
                    (io, false)
                } else {
                    // requests go out in absolute form
                    (io, true)
                }
            }
            Route::Socks(proxy) => {
                let tcp = dial(&proxy.addr(), inner.proxy_dial_timeout).await?;
                let stream = socks::establish(
                    tcp,
                    proxy,
                    &authority,
                    Some(inner.proxy_handshake_timeout),
                )
                .await?;
                (Box::new(stream) as BoxedIo, false)
            }
        };

        if !is_https {
            return Ok(Conn::new(MaybeTlsStream::Plain(io), proxied, false, permit));
        }

        let tls = inner
            .tls_handshake(&inner.origin_tls, io, &host, inner.tls_handshake_timeout)
            .await?;
        let h2 = tls.get_ref().1.alpn_protocol() == Some(ALPN_H2);
        Ok(Conn::new(MaybeTlsStream::Tls(Box::new(tls)), false, h2, permit))
    }
}

impl ConnectorInner {
    /// Dial a forward proxy, wrapping the connection in TLS for `https://` proxies.
    async fn dial_proxy(&self, proxy: &ProxyTarget) -> Result<BoxedIo> {
        let tcp = dial(&proxy.addr(), self.proxy_dial_timeout).await?;
        if proxy.scheme != ProxyScheme::Https {
            return Ok(Box::new(tcp));
        }
        let tls = self
            .tls_handshake(
                &self.proxy_tls,
                Box::new(tcp),
                &proxy.host,
                self.proxy_handshake_timeout,
            )
            .await?;
        Ok(Box::new(tls))
    }

    async fn tls_handshake(
        &self,
        connector: &TlsConnector,
        io: BoxedIo,
        host: &str,
        limit: Duration,
    ) -> Result<TlsStream<BoxedIo>> {
        let name = tls::server_name(host)?;
        match timeout(limit, connector.connect(name, io)).await {
            Ok(res) => res.map_err(|e| Error::Tls(format!("handshake with {}: {}", host, e))),
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl tower::Service<Uri> for Connector {
    type Response = Conn;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Conn>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        Box::pin(self.clone().connect(dst))
    }
}

async fn dial(addr: &str, limit: Duration) -> Result<TcpStream> {
    let stream = match timeout(limit, TcpStream::connect(addr)).await {
        Ok(res) => res.map_err(|e| Error::Connect(format!("dial {}: {}", addr, e)))?,
        Err(_) => return Err(Error::Timeout),
    };
    stream.set_nodelay(true).ok();
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive).ok();
    Ok(stream)
}

/// Open an HTTP `CONNECT` tunnel to `host:port` over an established proxy stream.
pub(crate) async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth: Option<&HeaderValue>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = join_host_port(host, port);
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority).into_bytes();
    if let Some(auth) = auth {
        request.extend_from_slice(b"Proxy-Authorization: ");
        request.extend_from_slice(auth.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut buf = [0u8; MAX_CONNECT_RESPONSE];
    let mut len = 0;
    let head_end = loop {
        if len == buf.len() {
            return Err(Error::Connect("proxy CONNECT response headers too long".into()));
        }
        let n = stream.read(&mut buf[len..]).await?;
        if n == 0 {
            return Err(Error::Connect("unexpected eof while tunneling".into()));
        }
        len += n;
        if let Some(end) = find_header_end(&buf[..len]) {
            break end;
        }
    };

    let status = parse_status_line(&buf[..head_end])?;
    if !(200..300).contains(&status) {
        return Err(Error::TunnelRejected { status });
    }
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(head: &[u8]) -> Result<u16> {
    let malformed = || Error::Connect("malformed proxy CONNECT response".into());
    let line = head.split(|b| *b == b'\n').next().ok_or_else(malformed)?;
    let line = std::str::from_utf8(line).map_err(|_| malformed())?;
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some(version) if version.starts_with("HTTP/1.") => {}
        _ => return Err(malformed()),
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(malformed)
}

type HostMap = Arc<Mutex<HashMap<String, Arc<Semaphore>>>>;

/// Caps concurrent connections per `host:port`.
///
/// A host's entry lives only while a permit for it is held or awaited.
struct HostLimiter {
    max: usize,
    hosts: HostMap,
}

impl HostLimiter {
    fn new(max: usize) -> Self {
        Self {
            max,
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn acquire(&self, key: &str) -> Option<HostPermit> {
        if self.max == 0 {
            return None;
        }
        let semaphore = self
            .hosts
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max)))
            .clone();
        let acquired = semaphore.acquire_owned().await.ok();
        let permit = HostPermit {
            permit: acquired,
            key: key.to_string(),
            hosts: self.hosts.clone(),
        };
        permit.permit.is_some().then_some(permit)
    }

    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        self.hosts.lock().len()
    }
}

/// A connection slot for one host, released on drop.
struct HostPermit {
    permit: Option<OwnedSemaphorePermit>,
    key: String,
    hosts: HostMap,
}

impl Drop for HostPermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        let mut hosts = self.hosts.lock();
        // permits and waiters hold clones of the semaphore
        if hosts
            .get(&self.key)
            .map_or(false, |semaphore| Arc::strong_count(semaphore) == 1)
        {
            hosts.remove(&self.key);
        }
    }
}

/// A plain or TLS-wrapped stream, possibly already tunneled through a proxy.
pub(crate) enum MaybeTlsStream {
    Plain(BoxedIo),
    Tls(Box<TlsStream<BoxedIo>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A connection handed to the pooled client.
///
/// Holds the per-host permit until hyper drops the connection.
pub struct Conn {
    io: TokioIo<MaybeTlsStream>,
    proxied: bool,
    h2: bool,
    _permit: Option<HostPermit>,
}

impl Conn {
    fn new(
        stream: MaybeTlsStream,
        proxied: bool,
        h2: bool,
        permit: Option<HostPermit>,
    ) -> Self {
        Self {
            io: TokioIo::new(stream),
            proxied,
            h2,
            _permit: permit,
        }
    }
}

impl Connection for Conn {
    fn connected(&self) -> Connected {
        let connected = Connected::new().proxy(self.proxied);
        if self.h2 {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

impl hyper::rt::Read for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.io), cx, buf)
    }
}

impl hyper::rt::Write for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.io), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.io), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.io), cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_from_proxy() {
        assert!(matches!(Route::from_proxy(None), Route::Direct));
        let socks = ProxyTarget::parse("socks5://127.0.0.1:1080").unwrap();
        assert!(matches!(Route::from_proxy(Some(socks)), Route::Socks(_)));
        let http = ProxyTarget::parse("127.0.0.1:3128").unwrap();
        let route = Route::from_proxy(Some(http));
        assert!(matches!(route, Route::Forward(_)));
        assert_eq!(route.proxy().unwrap().port, 3128);
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 Connection established").unwrap(), 200);
        assert_eq!(parse_status_line(b"HTTP/1.0 407 Proxy Auth\r\nX: y").unwrap(), 407);
        assert!(parse_status_line(b"SSH-2.0-OpenSSH").is_err());
    }

    #[tokio::test]
    async fn test_http_connect_success() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let stub = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let mut len = 0;
            while find_header_end(&buf[..len]).is_none() {
                len += server.read(&mut buf[len..]).await.unwrap();
            }
            let head = String::from_utf8_lossy(&buf[..len]).to_string();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            (head, server)
        });

        let auth = HeaderValue::from_static("Basic dXNlcjpwYXNz");
        http_connect(&mut client, "example.com", 443, Some(&auth))
            .await
            .unwrap();

        let (head, _server) = stub.await.unwrap();
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com:443\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_http_connect_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server.read(&mut buf).await;
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
            server
        });

        let err = http_connect(&mut client, "example.com", 443, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelRejected { status: 407 }));
    }

    #[tokio::test]
    async fn test_host_limiter_caps_permits() {
        let limiter = HostLimiter::new(1);
        let first = limiter.acquire("a:80").await;
        assert!(first.is_some());

        // a different host has its own budget
        assert!(limiter.acquire("b:80").await.is_some());

        let blocked = tokio::time::timeout(Duration::from_millis(20), limiter.acquire("a:80")).await;
        assert!(blocked.is_err());

        drop(first);
        assert!(limiter.acquire("a:80").await.is_some());
    }

    #[tokio::test]
    async fn test_host_limiter_forgets_idle_hosts() {
        let limiter = HostLimiter::new(2);
        let a1 = limiter.acquire("a:80").await;
        let a2 = limiter.acquire("a:80").await;
        let b = limiter.acquire("b:80").await;
        assert_eq!(limiter.tracked_hosts(), 2);

        drop(b);
        assert_eq!(limiter.tracked_hosts(), 1);
        drop(a1);
        // one connection to a:80 is still open
        assert_eq!(limiter.tracked_hosts(), 1);
        drop(a2);
        assert_eq!(limiter.tracked_hosts(), 0);

        for port in 0..100 {
            drop(limiter.acquire(&format!("host{}:443", port)).await);
        }
        assert_eq!(limiter.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn test_unlimited_host_limiter() {
        let limiter = HostLimiter::new(0);
        assert!(limiter.acquire("a:80").await.is_none());
    }
}
