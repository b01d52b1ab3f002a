//! HTTP/3 side transport over QUIC.
//!
//! Only built for clients without a proxy. Connections are cached per
//! authority and evicted on the first failed round trip.

use crate::body::with_deadline;
use crate::error::{Error, Result};
use crate::proxy::join_host_port;
use crate::tls::ALPN_H3;
use crate::transport::into_response;

use bytes::{Buf, Bytes};
use h3::client::SendRequest;
use http_body_util::BodyExt;
use log::{debug, info};
use parking_lot::Mutex;
use reqwest::{Request, Response};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::{timeout, Instant};

type Sender = SendRequest<h3_quinn::OpenStreams, Bytes>;

/// Live connections keyed by authority.
///
/// Every entry carries a generation so a closing connection only evicts
/// itself, never a newer one for the same authority.
pub(crate) struct ConnectionCache<T> {
    next_generation: AtomicU64,
    entries: Mutex<HashMap<String, (u64, T)>>,
}

impl<T: Clone> ConnectionCache<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_generation: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<T> {
        self.entries.lock().get(key).map(|(_, value)| value.clone())
    }

    /// Cache `value` unless a connection raced us to it.
    ///
    /// Returns the value to use and, when `value` was stored, its generation.
    pub(crate) fn insert_or_existing(&self, key: &str, value: T) -> (T, Option<u64>) {
        let mut entries = self.entries.lock();
        if let Some((_, existing)) = entries.get(key) {
            return (existing.clone(), None);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(key.to_string(), (generation, value.clone()));
        (value, Some(generation))
    }

    /// Remove `key` if it still holds `generation`.
    pub(crate) fn evict(&self, key: &str, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(key).map(|(g, _)| *g) == Some(generation) {
            entries.remove(key);
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub(crate) struct Http3Transport {
    client_config: quinn::ClientConfig,
    endpoint: OnceCell<quinn::Endpoint>,
    connections: Arc<ConnectionCache<Sender>>,
    connect_timeout: Duration,
}

impl Http3Transport {
    pub(crate) fn new(mut tls: rustls::ClientConfig, connect_timeout: Duration) -> Result<Self> {
        tls.alpn_protocols = vec![ALPN_H3.to_vec()];
        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| Error::Tls(e.to_string()))?;

        Ok(Self {
            client_config: quinn::ClientConfig::new(Arc::new(crypto)),
            endpoint: OnceCell::new(),
            connections: Arc::new(ConnectionCache::new()),
            connect_timeout,
        })
    }

    pub(crate) async fn execute(
        &self,
        mut req: Request,
        deadline: Option<Instant>,
    ) -> Result<Response> {
        let url = req.url().clone();
        let host = url
            .host_str()
            .ok_or_else(|| Error::Request(format!("missing host in {}", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);
        let authority = join_host_port(&host, port);

        // QUIC frames are sent from a buffer, streaming bodies are collected first
        let body = match req.body_mut().take() {
            Some(body) => body
                .collect()
                .await
                .map_err(|e| Error::Request(e.to_string()))?
                .to_bytes(),
            None => Bytes::new(),
        };

        let mut head = http::Request::builder()
            .method(req.method().clone())
            .uri(url.as_str());
        if let Some(headers) = head.headers_mut() {
            *headers = req.headers().clone();
        }
        let head = head.body(()).map_err(|e| Error::Request(e.to_string()))?;

        let mut sender = self.sender(&authority, &host, port).await?;
        match round_trip(&mut sender, head, body, deadline).await {
            Ok((parts, body)) => into_response(parts, body, url),
            Err(e) => {
                self.connections.remove(&authority);
                Err(e)
            }
        }
    }

    pub(crate) fn close_idle_connections(&self) {
        self.connections.clear();
    }

    async fn endpoint(&self) -> Result<&quinn::Endpoint> {
        self.endpoint
            .get_or_try_init(|| async {
                let mut endpoint =
                    quinn::Endpoint::client(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
                        .or_else(|_| {
                            quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
                        })?;
                endpoint.set_default_client_config(self.client_config.clone());
                Ok::<_, Error>(endpoint)
            })
            .await
    }

    async fn sender(&self, authority: &str, host: &str, port: u16) -> Result<Sender> {
        if let Some(sender) = self.connections.get(authority) {
            return Ok(sender);
        }

        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::Connect(format!("no addresses for {}", authority)))?;
        let endpoint = self.endpoint().await?;
        let connecting = endpoint.connect(addr, host).map_err(h3_error)?;
        let conn = match timeout(self.connect_timeout, connecting).await {
            Ok(res) => res.map_err(|e| Error::Connect(format!("quic {}: {}", authority, e)))?,
            Err(_) => return Err(Error::Timeout),
        };
        info!("HTTP/3 connection established to {}", authority);

        let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(conn))
            .await
            .map_err(h3_error)?;
        let (sender, generation) = self.connections.insert_or_existing(authority, sender);

        // a connection that lost the race closes once its sender is dropped
        let connections = self.connections.clone();
        let key = authority.to_string();
        tokio::spawn(async move {
            let err = driver.wait_idle().await;
            debug!("HTTP/3 connection to {} closed: {}", key, err);
            if let Some(generation) = generation {
                connections.evict(&key, generation);
            }
        });

        Ok(sender)
    }
}

async fn round_trip(
    sender: &mut Sender,
    head: http::Request<()>,
    body: Bytes,
    deadline: Option<Instant>,
) -> Result<(http::response::Parts, reqwest::Body)> {
    let mut stream = sender.send_request(head).await.map_err(h3_error)?;
    if !body.is_empty() {
        stream.send_data(body).await.map_err(h3_error)?;
    }
    stream.finish().await.map_err(h3_error)?;

    let (parts, ()) = stream.recv_response().await.map_err(h3_error)?.into_parts();

    let chunks = futures::stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        let next = match stream.recv_data().await {
            Ok(Some(mut chunk)) => Ok(Some(chunk.copy_to_bytes(chunk.remaining()))),
            Ok(None) => Ok(None),
            Err(e) => Err(e.to_string()),
        };
        match next {
            Ok(Some(bytes)) => Some((Ok(bytes), Some(stream))),
            Ok(None) => None,
            Err(msg) => Some((Err(io::Error::new(io::ErrorKind::Other, msg)), None)),
        }
    });

    Ok((parts, with_deadline(chunks, deadline)))
}

fn h3_error(e: impl ToString) -> Error {
    Error::Http3(e.to_string())
}
