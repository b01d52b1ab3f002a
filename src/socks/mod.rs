//! SOCKS4/4a and SOCKS5 client handshakes.
//!
//! Both engines drive an already connected stream to the proxy until the
//! proxy has opened a tunnel to the destination. After a successful
//! handshake the stream is positioned right after the proxy's reply and
//! carries the destination's bytes unmodified.

pub mod v4;
pub mod v5;

use crate::error::{Error, Result};
use crate::proxy::{join_host_port, ProxyScheme, ProxyTarget};

use log::{debug, warn};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

/// Destination the proxy is asked to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    /// Parse `host:port` or `[v6]:port`.
    ///
    /// The port must be within 1..=65535.
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidTarget(addr.to_string()))?;

        let host = if let Some(inner) = host.strip_prefix('[') {
            inner
                .strip_suffix(']')
                .ok_or_else(|| Error::InvalidTarget(addr.to_string()))?
        } else if host.contains(':') {
            // unbracketed IPv6 literal
            return Err(Error::InvalidTarget(addr.to_string()));
        } else {
            host
        };
        if host.is_empty() {
            return Err(Error::InvalidTarget(addr.to_string()));
        }

        let port = match port.parse::<u32>() {
            Ok(p) if (1..=65535).contains(&p) => p as u16,
            _ => return Err(Error::InvalidTargetPort(port.to_string())),
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_host_port(&self.host, self.port))
    }
}

/// Run the SOCKS handshake for `proxy` on `stream` and hand the stream back
/// once it tunnels to `target`.
///
/// The stream is consumed: on failure it is dropped, which closes the
/// underlying connection, so the caller never holds a half-negotiated
/// stream. `deadline` bounds the handshake only; the returned stream has
/// no deadline attached. The target is validated before any byte is sent.
pub async fn establish<S>(
    mut stream: S,
    proxy: &ProxyTarget,
    target: &str,
    deadline: Option<Duration>,
) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = TargetAddr::parse(target)?;
    debug!("{} handshake via {} to {}", proxy.scheme, proxy.addr(), target);

    let handshake = negotiate(&mut stream, proxy, &target);
    let outcome = match deadline.filter(|d| !d.is_zero()) {
        Some(limit) => match timeout(limit, handshake).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        },
        None => handshake.await,
    };

    match outcome {
        Ok(()) => Ok(stream),
        Err(e) => {
            warn!("{} handshake via {} failed: {}", proxy.scheme, proxy.addr(), e);
            drop(stream);
            Err(e)
        }
    }
}

async fn negotiate<S>(stream: &mut S, proxy: &ProxyTarget, target: &TargetAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let username = proxy.username.as_deref();
    let password = proxy.password.as_deref();
    match proxy.scheme {
        ProxyScheme::Socks5 => v5::handshake(stream, target, username, password).await,
        ProxyScheme::Socks4 | ProxyScheme::Socks4a => v4::handshake(stream, target, username).await,
        other => Err(Error::UnsupportedProxyScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_target() {
        let t = TargetAddr::parse("example.com:443").unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 443);

        let t = TargetAddr::parse("[2001:db8::1]:8080").unwrap();
        assert_eq!(t.host, "2001:db8::1");
        assert_eq!(t.to_string(), "[2001:db8::1]:8080");
    }

    #[test]
    fn test_parse_target_rejects_bad_ports() {
        for addr in ["example.com:0", "example.com:65536", "example.com:70000", "example.com:http"] {
            assert!(
                matches!(TargetAddr::parse(addr), Err(Error::InvalidTargetPort(_))),
                "{addr}"
            );
        }
        assert!(matches!(
            TargetAddr::parse("example.com"),
            Err(Error::InvalidTarget(_))
        ));
        assert!(matches!(TargetAddr::parse(":80"), Err(Error::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn test_invalid_port_fails_before_writing() {
        let (client, mut server) = tokio::io::duplex(64);
        let proxy = ProxyTarget::parse("socks5://127.0.0.1:1080").unwrap();

        let err = establish(client, &proxy, "example.com:0", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTargetPort(_)));

        // the client half was dropped without sending anything
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_bounds_handshake() {
        let (client, _server) = tokio::io::duplex(64);
        let proxy = ProxyTarget::parse("socks5://127.0.0.1:1080").unwrap();

        // the peer never answers the greeting
        let err = establish(client, &proxy, "example.com:80", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_establish_returns_usable_stream() {
        let (client, mut server) = tokio::io::duplex(256);
        let proxy = ProxyTarget::parse("socks4://127.0.0.1:1080").unwrap();

        let stub = tokio::spawn(async move {
            let mut req = [0u8; 9];
            server.read_exact(&mut req).await.unwrap();
            server
                .write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            server.write_all(b"pong").await.unwrap();
            server
        });

        let mut stream = establish(client, &proxy, "10.1.2.3:80", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        stub.await.unwrap();
    }
}
