//! Error types for the reqwest-tunnel-pool crate.

use std::io;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the client, its transports and the proxy handshakes can produce.
#[derive(Debug, Error)]
pub enum Error {
    /// The proxy string names a scheme this crate cannot route through.
    #[error("unsupported proxy scheme {0:?}")]
    UnsupportedProxyScheme(String),

    /// The proxy string could not be parsed as `[scheme://][user:pass@]host[:port]`.
    #[error("invalid proxy url {url:?}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    /// The tunnel destination is not a usable `host:port` pair.
    #[error("invalid target address {0:?}")]
    InvalidTarget(String),

    /// The tunnel destination port is outside 1..=65535.
    #[error("invalid target port {0:?}")]
    InvalidTargetPort(String),

    /// SOCKS5 username or password longer than 255 bytes.
    #[error("socks5: username/password too long")]
    CredentialsTooLong,

    /// A configuration value was rejected while building a client.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The proxy answered with a protocol version we did not speak.
    #[error("{protocol}: unexpected version {version}")]
    UnexpectedVersion { protocol: &'static str, version: u8 },

    /// The SOCKS5 proxy selected an authentication method we never offered.
    #[error("socks5: unsupported auth method {0}")]
    UnsupportedAuthMethod(u8),

    /// The SOCKS5 bound address carried an unknown address type.
    #[error("socks5: unknown atyp {0}")]
    UnknownAddressType(u8),

    /// The SOCKS5 proxy rejected the supplied credentials.
    #[error("socks5: auth failed (status={status})")]
    AuthenticationFailed { status: u8 },

    /// The SOCKS proxy refused to open the tunnel.
    #[error("{protocol}: connect failed (reply={reply})")]
    ProxyConnectFailed { protocol: &'static str, reply: u8 },

    /// The HTTP proxy answered the CONNECT request with a non-2xx status.
    #[error("proxy CONNECT rejected with status {status}")]
    TunnelRejected { status: u16 },

    /// Dialing the proxy or the origin failed.
    #[error("connect error: {0}")]
    Connect(String),

    #[error("tls error: {0}")]
    Tls(String),

    /// The HTTP/1.1 or HTTP/2 round trip failed.
    #[error("http error: {0}")]
    Http(#[source] hyper_util::client::legacy::Error),

    /// The HTTP/3 round trip failed.
    #[error("http3 error: {0}")]
    Http3(String),

    /// The request could not be turned into something the transport can send.
    #[error("invalid request: {0}")]
    Request(String),

    #[error("operation timed out")]
    Timeout,

    #[error("request canceled")]
    Canceled,

    /// Reading the response body failed after the head arrived.
    #[error("error reading response body: {0}")]
    Body(#[source] reqwest::Error),

    /// The response body exceeded the configured maximum size.
    #[error("response body too large (limit {limit} bytes)")]
    BodyTooLarge { limit: u64 },

    /// The pool holds no client to forward the request to.
    #[error("no available clients in pool")]
    NoAvailableClients,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Convert an error of the pooled client, surfacing what our connector reported.
    pub(crate) fn from_pooled(e: hyper_util::client::legacy::Error) -> Self {
        std::error::Error::source(&e)
            .and_then(|src| src.downcast_ref::<Error>())
            .and_then(Error::detached)
            .unwrap_or(Error::Http(e))
    }

    /// An owned copy of connection-phase errors that carry plain data.
    fn detached(&self) -> Option<Self> {
        let copy = match self {
            Error::InvalidTarget(t) => Error::InvalidTarget(t.clone()),
            Error::InvalidTargetPort(p) => Error::InvalidTargetPort(p.clone()),
            Error::CredentialsTooLong => Error::CredentialsTooLong,
            Error::UnexpectedVersion { protocol, version } => Error::UnexpectedVersion {
                protocol: *protocol,
                version: *version,
            },
            Error::UnsupportedAuthMethod(m) => Error::UnsupportedAuthMethod(*m),
            Error::UnknownAddressType(a) => Error::UnknownAddressType(*a),
            Error::AuthenticationFailed { status } => {
                Error::AuthenticationFailed { status: *status }
            }
            Error::ProxyConnectFailed { protocol, reply } => Error::ProxyConnectFailed {
                protocol: *protocol,
                reply: *reply,
            },
            Error::TunnelRejected { status } => Error::TunnelRejected { status: *status },
            Error::Connect(msg) => Error::Connect(msg.clone()),
            Error::Tls(msg) => Error::Tls(msg.clone()),
            Error::Timeout => Error::Timeout,
            _ => return None,
        };
        Some(copy)
    }

    /// Returns true when the failure was a deadline or timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            Error::Body(e) => e.is_timeout() || chain_timed_out(e),
            // connector failures come back wrapped by the pooled client
            Error::Http(e) => std::error::Error::source(e)
                .and_then(|src| src.downcast_ref::<Error>())
                .map_or(false, Error::is_timeout),
            _ => false,
        }
    }

    /// Returns true when the failure happened while establishing a connection.
    pub fn is_connect(&self) -> bool {
        match self {
            Error::Connect(_)
            | Error::Tls(_)
            | Error::TunnelRejected { .. }
            | Error::ProxyConnectFailed { .. }
            | Error::AuthenticationFailed { .. }
            | Error::UnexpectedVersion { .. }
            | Error::UnsupportedAuthMethod(_)
            | Error::UnknownAddressType(_) => true,
            Error::Http(e) => e.is_connect(),
            _ => false,
        }
    }

    pub fn is_body_too_large(&self) -> bool {
        matches!(self, Error::BodyTooLarge { .. })
    }

    pub(crate) fn invalid_proxy(url: &str, reason: impl ToString) -> Self {
        Error::InvalidProxyUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn chain_timed_out(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if io.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = err.source();
    }
    false
}
