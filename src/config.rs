//! Client configuration.

use crate::error::{Error, Result};

use reqwest::{Request, Response};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_CONNS_PER_HOST: usize = 512;
const DEFAULT_MAX_IDLE_CONNS: usize = 2048;
const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 512;
const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether a finished attempt should be retried.
///
/// Only consulted while attempts remain; non-idempotent requests and
/// requests with a one-shot body are never retried.
pub type RetryIf = Arc<dyn Fn(&Request, &Result<Response>) -> bool + Send + Sync>;

/// Called with each outgoing request before it is sent.
pub type OnRequest = Arc<dyn Fn(&mut Request) + Send + Sync>;
/// Called with each successful response.
pub type OnResponse = Arc<dyn Fn(&Response) + Send + Sync>;
/// Called before a retry with the 1-based number of the failed attempt and its error, if any.
pub type OnRetry = Arc<dyn Fn(&Request, usize, Option<&Error>) + Send + Sync>;
/// Called whenever an attempt fails.
pub type OnError = Arc<dyn Fn(&Request, &Error) + Send + Sync>;

/// Lifecycle hooks.
///
/// Hooks other than `on_request` see the request head only; the body may
/// already have been consumed.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_request: Option<OnRequest>,
    pub on_response: Option<OnResponse>,
    pub on_retry: Option<OnRetry>,
    pub on_error: Option<OnError>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Configuration for a [`Client`](crate::Client).
///
/// Zero counts and durations are replaced by their defaults when a client
/// is built.
#[derive(Clone)]
pub struct ClientConfig {
    /// Cap on concurrently open connections per host.
    pub max_conns_per_host: usize,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    /// How long an idle pooled connection is kept.
    pub idle_conn_timeout: Duration,
    pub dial_timeout: Duration,
    pub tls_handshake_timeout: Duration,

    /// `[scheme://][user:pass@]host[:port]`; schemes `http`, `https`, `socks4`, `socks4a`, `socks5`.
    pub proxy: Option<String>,
    /// Used when the proxy string carries no userinfo.
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub proxy_dial_timeout: Duration,
    /// Bounds the SOCKS handshake or HTTP `CONNECT` exchange.
    pub proxy_handshake_timeout: Duration,

    /// Replaces the built-in rustls configuration. Its ALPN list is overwritten.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub danger_accept_invalid_certs: bool,
    pub disable_http2: bool,
    /// Ignored when a proxy is configured.
    pub enable_http3: bool,

    /// Limit for the body helpers; `None` reads everything.
    pub max_response_body_size: Option<u64>,
    /// Used as the default `User-Agent`.
    pub name: Option<String>,
    pub no_default_user_agent: bool,

    /// Total attempts per request, first one included.
    pub max_attempts: usize,
    /// Fixed wait between attempts.
    pub retry_backoff: Duration,
    pub retry_if: Option<RetryIf>,
    pub hooks: Hooks,
}

impl ClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Replace zero values with defaults.
    pub fn normalized(mut self) -> Self {
        fn or_default<T: PartialEq + Default>(value: T, default: T) -> T {
            if value == T::default() {
                default
            } else {
                value
            }
        }

        self.max_conns_per_host = or_default(self.max_conns_per_host, DEFAULT_MAX_CONNS_PER_HOST);
        self.max_idle_conns = or_default(self.max_idle_conns, DEFAULT_MAX_IDLE_CONNS);
        self.max_idle_conns_per_host =
            or_default(self.max_idle_conns_per_host, DEFAULT_MAX_IDLE_CONNS_PER_HOST);
        self.idle_conn_timeout = or_default(self.idle_conn_timeout, DEFAULT_IDLE_CONN_TIMEOUT);
        self.dial_timeout = or_default(self.dial_timeout, DEFAULT_DIAL_TIMEOUT);
        self.tls_handshake_timeout =
            or_default(self.tls_handshake_timeout, DEFAULT_TLS_HANDSHAKE_TIMEOUT);
        self.proxy_dial_timeout = or_default(self.proxy_dial_timeout, self.dial_timeout);
        self.proxy_handshake_timeout = or_default(self.proxy_handshake_timeout, self.dial_timeout);
        self.max_attempts = self.max_attempts.max(1);
        self
    }

    /// Returns an error if the proxy string cannot be used.
    pub fn validate(&self) -> Result<()> {
        if let Some(proxy) = &self.proxy {
            crate::proxy::ProxyTarget::parse(proxy)?;
        }
        if self.max_response_body_size == Some(0) {
            return Err(Error::InvalidConfig(
                "max_response_body_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::new().build()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_conns_per_host", &self.max_conns_per_host)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_idle_conns_per_host", &self.max_idle_conns_per_host)
            .field("idle_conn_timeout", &self.idle_conn_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .field("tls_handshake_timeout", &self.tls_handshake_timeout)
            // may carry credentials
            .field("proxy", &self.proxy.as_ref().map(|_| "<set>"))
            .field("proxy_username", &self.proxy_username)
            .field("proxy_dial_timeout", &self.proxy_dial_timeout)
            .field("proxy_handshake_timeout", &self.proxy_handshake_timeout)
            .field("tls_config", &self.tls_config.is_some())
            .field("danger_accept_invalid_certs", &self.danger_accept_invalid_certs)
            .field("disable_http2", &self.disable_http2)
            .field("enable_http3", &self.enable_http3)
            .field("max_response_body_size", &self.max_response_body_size)
            .field("name", &self.name)
            .field("no_default_user_agent", &self.no_default_user_agent)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff", &self.retry_backoff)
            .field("retry_if", &self.retry_if.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Builder for `ClientConfig`.
#[derive(Default)]
pub struct ClientConfigBuilder {
    max_conns_per_host: Option<usize>,
    max_idle_conns: Option<usize>,
    max_idle_conns_per_host: Option<usize>,
    idle_conn_timeout: Option<Duration>,
    dial_timeout: Option<Duration>,
    tls_handshake_timeout: Option<Duration>,
    proxy: Option<String>,
    proxy_username: Option<String>,
    proxy_password: Option<String>,
    proxy_dial_timeout: Option<Duration>,
    proxy_handshake_timeout: Option<Duration>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    danger_accept_invalid_certs: bool,
    disable_http2: bool,
    enable_http3: bool,
    max_response_body_size: Option<u64>,
    name: Option<String>,
    no_default_user_agent: bool,
    max_attempts: Option<usize>,
    retry_backoff: Option<Duration>,
    retry_if: Option<RetryIf>,
    hooks: Hooks,
}

impl ClientConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_conns_per_host(mut self, max: usize) -> Self {
        self.max_conns_per_host = Some(max);
        self
    }

    pub fn max_idle_conns(mut self, max: usize) -> Self {
        self.max_idle_conns = Some(max);
        self
    }

    pub fn max_idle_conns_per_host(mut self, max: usize) -> Self {
        self.max_idle_conns_per_host = Some(max);
        self
    }

    pub fn idle_conn_timeout(mut self, timeout: Duration) -> Self {
        self.idle_conn_timeout = Some(timeout);
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    pub fn tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls_handshake_timeout = Some(timeout);
        self
    }

    /// Route every request through `proxy`.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Use an HTTP forward proxy at `host:port`.
    pub fn http_proxy(self, addr: impl AsRef<str>) -> Self {
        self.proxy(format!("http://{}", addr.as_ref()))
    }

    /// Use a SOCKS5 proxy at `host:port`.
    pub fn socks5_proxy(self, addr: impl AsRef<str>) -> Self {
        self.proxy(format!("socks5://{}", addr.as_ref()))
    }

    /// Use a SOCKS4 proxy at `host:port`; domain targets switch to SOCKS4a.
    pub fn socks4_proxy(self, addr: impl AsRef<str>) -> Self {
        self.proxy(format!("socks4://{}", addr.as_ref()))
    }

    /// Credentials for a proxy string without userinfo.
    pub fn proxy_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.proxy_username = Some(username.into());
        self.proxy_password = Some(password.into());
        self
    }

    pub fn proxy_dial_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_dial_timeout = Some(timeout);
        self
    }

    pub fn proxy_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_handshake_timeout = Some(timeout);
        self
    }

    pub fn tls_config(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(tls);
        self
    }

    /// Skip certificate verification. Only for testing.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    pub fn disable_http2(mut self, disable: bool) -> Self {
        self.disable_http2 = disable;
        self
    }

    /// Send `https` requests over HTTP/3. Has no effect together with a proxy.
    pub fn enable_http3(mut self, enable: bool) -> Self {
        self.enable_http3 = enable;
        self
    }

    pub fn max_response_body_size(mut self, limit: u64) -> Self {
        self.max_response_body_size = Some(limit);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn no_default_user_agent(mut self, disable: bool) -> Self {
        self.no_default_user_agent = disable;
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn retry_if<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &Result<Response>) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(f));
        self
    }

    pub fn on_request<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Request) + Send + Sync + 'static,
    {
        self.hooks.on_request = Some(Arc::new(f));
        self
    }

    pub fn on_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.hooks.on_response = Some(Arc::new(f));
        self
    }

    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, usize, Option<&Error>) + Send + Sync + 'static,
    {
        self.hooks.on_retry = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &Error) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(f));
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClientConfig {
        let dial_timeout = self.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT);
        ClientConfig {
            max_conns_per_host: self.max_conns_per_host.unwrap_or(DEFAULT_MAX_CONNS_PER_HOST),
            max_idle_conns: self.max_idle_conns.unwrap_or(DEFAULT_MAX_IDLE_CONNS),
            max_idle_conns_per_host: self
                .max_idle_conns_per_host
                .unwrap_or(DEFAULT_MAX_IDLE_CONNS_PER_HOST),
            idle_conn_timeout: self.idle_conn_timeout.unwrap_or(DEFAULT_IDLE_CONN_TIMEOUT),
            dial_timeout,
            tls_handshake_timeout: self
                .tls_handshake_timeout
                .unwrap_or(DEFAULT_TLS_HANDSHAKE_TIMEOUT),
            proxy: self.proxy,
            proxy_username: self.proxy_username,
            proxy_password: self.proxy_password,
            proxy_dial_timeout: self.proxy_dial_timeout.unwrap_or(dial_timeout),
            proxy_handshake_timeout: self.proxy_handshake_timeout.unwrap_or(dial_timeout),
            tls_config: self.tls_config,
            danger_accept_invalid_certs: self.danger_accept_invalid_certs,
            disable_http2: self.disable_http2,
            enable_http3: self.enable_http3,
            max_response_body_size: self.max_response_body_size,
            name: self.name,
            no_default_user_agent: self.no_default_user_agent,
            max_attempts: self.max_attempts.unwrap_or(1),
            retry_backoff: self.retry_backoff.unwrap_or(Duration::ZERO),
            retry_if: self.retry_if,
            hooks: self.hooks,
        }
        .normalized()
    }
}
