//! The per-client transport: a pooled HTTP/1.1 + HTTP/2 client plus the
//! optional HTTP/3 side transport.

use crate::body::with_deadline;
use crate::config::ClientConfig;
use crate::connect::{Connector, Route};
use crate::error::{Error, Result};
use crate::http3::Http3Transport;
use crate::proxy::ProxyTarget;
use crate::tls::{self, ALPN_H3};

use arc_swap::ArcSwap;
use http_body_util::BodyDataStream;
use hyper_util::client::legacy::{Builder, Client as PooledClient};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use log::info;
use reqwest::{Request, Response, ResponseBuilderExt};
use std::sync::Arc;
use tokio::time::Instant;
use url::Url;

type Primary = PooledClient<Connector, reqwest::Body>;

pub(crate) struct Transport {
    primary: ArcSwap<Primary>,
    builder: Builder,
    connector: Connector,
    http3: Option<Http3Transport>,
}

impl Transport {
    /// Build the transport for `config`, which must already be normalized.
    pub(crate) fn new(config: &ClientConfig, proxy: Option<ProxyTarget>) -> Result<Self> {
        let route = Route::from_proxy(proxy);
        let connector = Connector::new(config, route.clone())?;

        let mut builder = PooledClient::builder(TokioExecutor::new());
        builder
            .pool_timer(TokioTimer::new())
            .timer(TokioTimer::new())
            .pool_idle_timeout(config.idle_conn_timeout)
            .pool_max_idle_per_host(config.max_idle_conns_per_host.min(config.max_idle_conns));

        // QUIC cannot be tunneled through the proxies we speak; proxy
        // credentials alone also count as proxy configuration
        let proxy_configured = !matches!(route, Route::Direct)
            || config.proxy_username.is_some()
            || config.proxy_password.is_some();
        let http3 = match (proxy_configured, config.enable_http3) {
            (false, true) => {
                let tls = tls::client_config(config, &[ALPN_H3])?;
                Some(Http3Transport::new(tls, config.dial_timeout)?)
            }
            (true, true) => {
                info!("HTTP/3 disabled: not supported through a proxy");
                None
            }
            (_, false) => None,
        };

        let primary = builder.build(connector.clone());
        Ok(Self {
            primary: ArcSwap::from_pointee(primary),
            builder,
            connector,
            http3,
        })
    }

    pub(crate) fn route(&self) -> &Route {
        self.connector.route()
    }

    pub(crate) fn uses_http3(&self) -> bool {
        self.http3.is_some()
    }

    /// One round trip, no retries.
    ///
    /// `deadline` also bounds reading the returned body.
    pub(crate) async fn execute(&self, req: Request, deadline: Option<Instant>) -> Result<Response> {
        if let Some(h3) = &self.http3 {
            if req.url().scheme() == "https" {
                return h3.execute(req, deadline).await;
            }
        }

        let url = req.url().clone();
        let req: http::Request<reqwest::Body> = req
            .try_into()
            .map_err(|e: reqwest::Error| Error::Request(e.to_string()))?;

        let client = self.primary.load_full();
        let (parts, incoming) = client
            .request(req)
            .await
            .map_err(Error::from_pooled)?
            .into_parts();
        let body = with_deadline(BodyDataStream::new(incoming), deadline);
        into_response(parts, body, url)
    }

    /// Drop every idle pooled connection.
    ///
    /// In-flight requests keep their connections; new requests dial fresh ones.
    pub(crate) fn close_idle_connections(&self) {
        self.primary
            .store(Arc::new(self.builder.build(self.connector.clone())));
        if let Some(h3) = &self.http3 {
            h3.close_idle_connections();
        }
    }
}

pub(crate) fn into_response(
    parts: http::response::Parts,
    body: reqwest::Body,
    url: Url,
) -> Result<Response> {
    let mut builder = http::Response::builder()
        .status(parts.status)
        .version(parts.version)
        .url(url);
    if let Some(headers) = builder.headers_mut() {
        *headers = parts.headers;
    }
    let response = builder
        .body(body)
        .map_err(|e| Error::Request(e.to_string()))?;
    Ok(Response::from(response))
}
