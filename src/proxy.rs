//! Proxy target parsing.

use crate::error::{Error, Result};

use base64::Engine;
use http::HeaderValue;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Port assumed for SOCKS proxies given without one.
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Protocol spoken with the proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    /// Plain-text forward proxy; HTTPS targets go through `CONNECT`.
    Http,
    /// Forward proxy reached over TLS.
    Https,
    Socks4,
    /// SOCKS4 with proxy-side name resolution.
    Socks4a,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks4a => "socks4a",
            ProxyScheme::Socks5 => "socks5",
        }
    }

    /// Returns true for the schemes that tunnel with a SOCKS handshake.
    pub fn is_socks(&self) -> bool {
        matches!(
            self,
            ProxyScheme::Socks4 | ProxyScheme::Socks4a | ProxyScheme::Socks5
        )
    }
}

impl FromStr for ProxyScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyScheme::Http),
            "https" => Ok(ProxyScheme::Https),
            "socks4" => Ok(ProxyScheme::Socks4),
            "socks4a" => Ok(ProxyScheme::Socks4a),
            // remote resolution is what we do for socks5 anyway
            "socks5" | "socks5h" => Ok(ProxyScheme::Socks5),
            _ => Err(Error::UnsupportedProxyScheme(s.to_string())),
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed proxy specification.
///
/// Derived once from a proxy string when a client is built and never
/// mutated afterwards. The port is always resolved.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyTarget {
    pub scheme: ProxyScheme,
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyTarget {
    /// Parse `[scheme://][user:pass@]host[:port]`.
    ///
    /// A missing scheme means `http`. SOCKS proxies without a port get
    /// [`DEFAULT_SOCKS_PORT`].
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_with_auth(input, None, None)
    }

    /// Parse a proxy string, falling back to separately configured credentials.
    ///
    /// Userinfo embedded in the string wins over `username`/`password`.
    pub fn parse_with_auth(
        input: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::invalid_proxy(input, "empty proxy"));
        }

        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("http://{}", input)
        };

        let (scheme_str, _) = with_scheme
            .split_once("://")
            .ok_or_else(|| Error::invalid_proxy(input, "missing scheme"))?;
        let scheme: ProxyScheme = scheme_str.parse()?;

        let url = Url::parse(&with_scheme).map_err(|e| Error::invalid_proxy(input, e))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::invalid_proxy(input, "missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = match url.port() {
            Some(port) => port,
            None if scheme.is_socks() => DEFAULT_SOCKS_PORT,
            None => url
                .port_or_known_default()
                .ok_or_else(|| Error::invalid_proxy(input, "missing port"))?,
        };

        let mut user = username.filter(|u| !u.is_empty()).map(str::to_string);
        let mut pass = password.filter(|p| !p.is_empty()).map(str::to_string);
        if !url.username().is_empty() {
            user = Some(decode(input, url.username())?);
            if let Some(p) = url.password() {
                pass = Some(decode(input, p)?);
            }
        }

        Ok(Self {
            scheme,
            host,
            port,
            username: user,
            password: pass,
        })
    }

    /// The proxy address as `host:port`, bracketing IPv6 literals.
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }

    /// `Proxy-Authorization: Basic ...` value for forward proxies with credentials.
    ///
    /// SOCKS proxies authenticate inside their own handshake and get `None`.
    pub fn basic_auth(&self) -> Option<HeaderValue> {
        if self.scheme.is_socks() || !self.has_credentials() {
            return None;
        }
        let creds = format!(
            "{}:{}",
            self.username.as_deref().unwrap_or(""),
            self.password.as_deref().unwrap_or("")
        );
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        let mut value = HeaderValue::from_str(&format!("Basic {}", encoded)).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}

impl FromStr for ProxyTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// Never print the password.
impl fmt::Debug for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyTarget")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}://{}@{}", self.scheme, user, self.addr()),
            None => write!(f, "{}://{}", self.scheme, self.addr()),
        }
    }
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn decode(input: &str, raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| Error::invalid_proxy(input, e))
}
