//! The request executor.
//!
//! A [`Client`] owns one transport (and optionally the HTTP/3 side
//! transport) and runs every request through the retry loop: default
//! headers, lifecycle hooks, dispatch and retry decisions.

use crate::body::{read_capped, BufferPool};
use crate::config::ClientConfig;
use crate::connect::Route;
use crate::error::{Error, Result};
use crate::proxy::ProxyTarget;
use crate::retry::{Decision, RetryPlan};
use crate::transport::Transport;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, PROXY_AUTHORIZATION, USER_AGENT};
use http::{HeaderValue, Method, StatusCode};
use log::{info, warn};
use once_cell::sync::OnceCell;
use reqwest::{Request, Response};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// An HTTP client with its own transport, proxy route and retry policy.
///
/// Cloning is cheap; clones share the transport and its connection pool.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<ClientConfig>,
    inner: OnceCell<Inner>,
}

struct Inner {
    config: Arc<ClientConfig>,
    transport: Transport,
    proxy_authorization: Option<HeaderValue>,
    user_agent: Option<HeaderValue>,
    buffers: BufferPool,
}

impl Client {
    /// Build a client, failing fast on a bad proxy or TLS setup.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Self::lazy(config);
        client.inner()?;
        Ok(client)
    }

    /// A client whose transport is built on first use.
    ///
    /// Construction errors surface from the first request instead.
    pub fn lazy(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config.normalized()),
                inner: OnceCell::new(),
            }),
        }
    }

    /// The configuration in use, with defaults filled in.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// The parsed proxy, if one is configured.
    pub fn proxy(&self) -> Result<Option<&ProxyTarget>> {
        Ok(self.inner()?.transport.route().proxy())
    }

    /// Returns true when `https` requests go over HTTP/3.
    pub fn uses_http3(&self) -> Result<bool> {
        Ok(self.inner()?.transport.uses_http3())
    }

    fn inner(&self) -> Result<&Inner> {
        self.shared
            .inner
            .get_or_try_init(|| Inner::new(self.shared.config.clone()))
    }

    /// Send a request, retrying as configured.
    pub async fn execute(&self, req: Request) -> Result<Response> {
        self.inner()?.execute(req, None, None).await
    }

    /// Like [`execute`](Self::execute), aborting as soon as `token` is cancelled.
    ///
    /// No new attempt starts after cancellation.
    pub async fn execute_with_cancel(
        &self,
        req: Request,
        token: &CancellationToken,
    ) -> Result<Response> {
        self.inner()?.execute(req, Some(token), None).await
    }

    /// Bound the whole call, retries and reading the body included, by `timeout`.
    pub async fn execute_timeout(&self, req: Request, timeout: Duration) -> Result<Response> {
        if timeout.is_zero() {
            return Err(Error::Timeout);
        }
        self.execute_deadline(req, Instant::now() + timeout).await
    }

    /// Bound the whole call, retries and reading the body included, by `deadline`.
    pub async fn execute_deadline(&self, req: Request, deadline: Instant) -> Result<Response> {
        if deadline <= Instant::now() {
            return Err(Error::Timeout);
        }
        let inner = self.inner()?;
        match tokio::time::timeout_at(deadline, inner.execute(req, None, Some(deadline))).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// GET `url` and read the body, all within `timeout`.
    pub async fn get_bytes_timeout(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<(Bytes, StatusCode)> {
        let req = Request::new(Method::GET, parse_url(url)?);
        let resp = self.execute_timeout(req, timeout).await?;
        self.read_body(resp).await
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.execute(Request::new(Method::GET, parse_url(url)?)).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.execute(Request::new(Method::DELETE, parse_url(url)?)).await
    }

    /// POST `body` with the given content type; an empty `content_type` sends none.
    pub async fn post_bytes(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<Response> {
        let mut req = Request::new(Method::POST, parse_url(url)?);
        if !content_type.is_empty() {
            let value = HeaderValue::from_str(content_type)
                .map_err(|e| Error::Request(e.to_string()))?;
            req.headers_mut().insert(CONTENT_TYPE, value);
        }
        *req.body_mut() = Some(reqwest::Body::from(body.into()));
        self.execute(req).await
    }

    /// POST `fields` as `application/x-www-form-urlencoded`.
    pub async fn post_form<K, V>(&self, url: &str, fields: &[(K, V)]) -> Result<Response>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in fields {
            form.append_pair(key.as_ref(), value.as_ref());
        }
        self.post_bytes(url, "application/x-www-form-urlencoded", form.finish())
            .await
    }

    /// GET `url` and read the whole body, honoring `max_response_body_size`.
    pub async fn get_bytes(&self, url: &str) -> Result<(Bytes, StatusCode)> {
        let resp = self.get(url).await?;
        self.read_body(resp).await
    }

    /// GET `url` and read the body as text.
    pub async fn get_string(&self, url: &str) -> Result<(String, StatusCode)> {
        let (body, status) = self.get_bytes(url).await?;
        Ok((String::from_utf8_lossy(&body).into_owned(), status))
    }

    /// Read the whole body of `resp` through this client's buffers and size limit.
    pub async fn read_body(&self, resp: Response) -> Result<(Bytes, StatusCode)> {
        let inner = self.inner()?;
        let status = resp.status();
        let body = read_capped(resp, inner.config.max_response_body_size, &inner.buffers).await?;
        Ok((body, status))
    }

    /// Drop idle pooled connections of both transports.
    pub fn close_idle_connections(&self) {
        if let Some(inner) = self.shared.inner.get() {
            inner.transport.close_idle_connections();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.shared.config)
            .field("initialized", &self.shared.inner.get().is_some())
            .finish()
    }
}

impl Inner {
    fn new(config: Arc<ClientConfig>) -> Result<Self> {
        config.validate()?;

        let proxy = match &config.proxy {
            Some(raw) => Some(ProxyTarget::parse_with_auth(
                raw,
                config.proxy_username.as_deref(),
                config.proxy_password.as_deref(),
            )?),
            None => None,
        };
        match &proxy {
            Some(p) => info!("Client routes through {} proxy {}", p.scheme, p.addr()),
            None => info!("Client connects directly"),
        }

        let proxy_authorization = proxy.as_ref().and_then(ProxyTarget::basic_auth);
        let user_agent = if config.no_default_user_agent {
            None
        } else {
            let ua = config.name.as_deref().unwrap_or(DEFAULT_USER_AGENT);
            Some(HeaderValue::from_str(ua).map_err(|e| Error::InvalidConfig(e.to_string()))?)
        };

        let transport = Transport::new(&config, proxy)?;
        Ok(Self {
            config,
            transport,
            proxy_authorization,
            user_agent,
            buffers: BufferPool::default(),
        })
    }

    /// `deadline` bounds every attempt and the body of the returned response.
    async fn execute(
        &self,
        req: Request,
        cancel: Option<&CancellationToken>,
        deadline: Option<Instant>,
    ) -> Result<Response> {
        // one-shot (streaming) bodies cannot be cloned and are never replayed
        let replay = req.try_clone();
        let plan = RetryPlan::new(
            req.method(),
            replay.is_some(),
            self.config.max_attempts,
            self.config.retry_backoff,
        );
        let view = head_of(&req);
        let hooks = &self.config.hooks;

        let mut current = req;
        let mut attempt = 1;
        loop {
            if cancel.map_or(false, CancellationToken::is_cancelled) {
                return Err(Error::Canceled);
            }

            let outcome = cancellable(self.attempt(current, deadline), cancel).await;
            if let (Err(e), Some(on_error)) = (&outcome, &hooks.on_error) {
                on_error(&view, e);
            }

            let should_retry = match &self.config.retry_if {
                Some(retry_if) => retry_if(&view, &outcome),
                None => plan.default_should_retry(&outcome),
            };
            let backoff = match plan.decide(attempt, should_retry) {
                Decision::Stop => return outcome,
                Decision::Retry { backoff } => backoff,
            };
            let Some(next) = replay.as_ref().and_then(Request::try_clone) else {
                return outcome;
            };

            match &outcome {
                Err(e) => info!(
                    "Retrying {} {} (attempt {} of {}): {}",
                    view.method(),
                    view.url(),
                    attempt + 1,
                    plan.max_attempts(),
                    e
                ),
                Ok(resp) => info!(
                    "Retrying {} {} (attempt {} of {}): status {}",
                    view.method(),
                    view.url(),
                    attempt + 1,
                    plan.max_attempts(),
                    resp.status()
                ),
            }
            if let Some(on_retry) = &hooks.on_retry {
                on_retry(&view, attempt, outcome.as_ref().err());
            }
            // releases the connection of a discarded response
            drop(outcome);

            if !backoff.is_zero() {
                cancellable(
                    async {
                        tokio::time::sleep(backoff).await;
                        Ok(())
                    },
                    cancel,
                )
                .await?;
            }

            current = next;
            attempt += 1;
        }
    }

    async fn attempt(&self, mut req: Request, deadline: Option<Instant>) -> Result<Response> {
        self.apply_default_headers(&mut req);
        if let Some(on_request) = &self.config.hooks.on_request {
            on_request(&mut req);
        }

        // the request timeout covers this attempt up to the end of the body
        let deadline = match (req.timeout().map(|t| Instant::now() + *t), deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let dispatch = self.transport.execute(req, deadline);
        let resp = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, dispatch).await {
                Ok(res) => res?,
                Err(_) => return Err(Error::Timeout),
            },
            None => dispatch.await?,
        };

        if let Some(on_response) = &self.config.hooks.on_response {
            on_response(&resp);
        }
        Ok(resp)
    }

    fn apply_default_headers(&self, req: &mut Request) {
        // credentials only travel in the request for plain-http forwarding;
        // https targets carry them on CONNECT
        if let (Some(auth), Route::Forward(_)) = (&self.proxy_authorization, self.transport.route()) {
            if req.url().scheme() == "http" && !req.headers().contains_key(PROXY_AUTHORIZATION) {
                req.headers_mut().insert(PROXY_AUTHORIZATION, auth.clone());
            }
        }
        if let Some(ua) = &self.user_agent {
            if !req.headers().contains_key(USER_AGENT) {
                req.headers_mut().insert(USER_AGENT, ua.clone());
            }
        }
    }
}

/// Copy of the request without its body, handed to hooks.
fn head_of(req: &Request) -> Request {
    let mut head = Request::new(req.method().clone(), req.url().clone());
    *head.headers_mut() = req.headers().clone();
    *head.timeout_mut() = req.timeout().copied();
    *head.version_mut() = req.version();
    head
}

async fn cancellable<T, F>(fut: F, cancel: Option<&CancellationToken>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match cancel {
        Some(token) => {
            tokio::select! {
                res = fut => res,
                _ = token.cancelled() => {
                    warn!("Request canceled");
                    Err(Error::Canceled)
                }
            }
        }
        None => fut.await,
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::Request(format!("{}: {}", url, e)))
}
