//! Round-robin pool of independently configured clients.

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::utils;

use log::info;
use reqwest::{Request, Response};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A fixed set of clients used in strict round-robin order.
///
/// Each client keeps its own transport, so a pool over several proxies
/// rotates both connections and exit addresses. Membership never changes
/// after construction.
pub struct ClientPool {
    clients: Vec<Client>,
    /// Used for round-robin client selection.
    cursor: AtomicUsize,
}

impl ClientPool {
    /// Build `size` clients with `factory`, which gets the member index.
    ///
    /// A size of zero builds a single client.
    pub fn new<F>(size: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<Client>,
    {
        let clients = (0..size.max(1))
            .map(&mut factory)
            .collect::<Result<Vec<_>>>()?;
        info!("Built client pool with {} clients", clients.len());
        Ok(Self::from_clients(clients))
    }

    /// Wrap existing clients. An empty pool fails every request with
    /// [`Error::NoAvailableClients`].
    pub fn from_clients(clients: Vec<Client>) -> Self {
        Self {
            clients,
            cursor: AtomicUsize::new(0),
        }
    }

    /// `size` clients that all use the same `proxy`, to scale connection count.
    pub fn with_proxy(size: usize, proxy: &str, base: &ClientConfig) -> Result<Self> {
        Self::new(size, |_| {
            let mut config = base.clone();
            config.proxy = Some(proxy.to_string());
            Client::new(config)
        })
    }

    /// `per_proxy` clients for each entry of `proxies`, interleaved so that
    /// consecutive picks rotate through the proxies.
    pub fn with_proxies<S: AsRef<str>>(
        proxies: &[S],
        per_proxy: usize,
        base: &ClientConfig,
    ) -> Result<Self> {
        if proxies.is_empty() {
            return Err(Error::NoAvailableClients);
        }
        let per_proxy = per_proxy.max(1);
        let pool = Self::new(proxies.len() * per_proxy, |i| {
            let mut config = base.clone();
            config.proxy = Some(proxies[i % proxies.len()].as_ref().to_string());
            Client::new(config)
        })?;
        info!(
            "Client pool rotates through {} proxies, {} clients each",
            proxies.len(),
            per_proxy
        );
        Ok(pool)
    }

    /// Like [`with_proxies`](Self::with_proxies) for a newline, comma or
    /// semicolon separated list. Lines starting with `#` are skipped.
    pub fn from_proxy_list(list: &str, per_proxy: usize, base: &ClientConfig) -> Result<Self> {
        let proxies = utils::parse_proxy_list(list);
        Self::with_proxies(&proxies, per_proxy, base)
    }

    /// Load the proxy list from a file path or an `http(s)` URL.
    pub async fn from_source(source: &str, per_proxy: usize, base: &ClientConfig) -> Result<Self> {
        let proxies = utils::fetch_proxies_from_source(source).await?;
        info!("Fetched {} proxies from {}", proxies.len(), source);
        Self::with_proxies(&proxies, per_proxy, base)
    }

    /// The next client in round-robin order, or `None` for an empty pool.
    pub fn next(&self) -> Option<&Client> {
        if self.clients.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(&self.clients[i % self.clients.len()])
    }

    /// Send `req` with the next client. Retries stay on that client.
    pub async fn execute(&self, req: Request) -> Result<Response> {
        let client = self.next().ok_or(Error::NoAvailableClients)?;
        client.execute(req).await
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn close_idle_connections(&self) {
        for client in &self.clients {
            client.close_idle_connections();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn index_of(pool: &ClientPool, picked: &Client) -> usize {
        pool.clients()
            .iter()
            .position(|c| std::ptr::eq(c, picked))
            .unwrap()
    }

    #[test]
    fn test_round_robin_order() {
        let pool = ClientPool::new(3, |_| Ok(Client::lazy(ClientConfig::default()))).unwrap();
        let picks: Vec<usize> = (0..6).map(|_| index_of(&pool, pool.next().unwrap())).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_concurrent_next_covers_each_client_once() {
        const N: usize = 16;
        let pool = Arc::new(
            ClientPool::new(N, |_| Ok(Client::lazy(ClientConfig::default()))).unwrap(),
        );

        let picks: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..N)
                .map(|_| {
                    let pool = &pool;
                    s.spawn(move || index_of(pool, pool.next().unwrap()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut sorted = picks;
        sorted.sort_unstable();
        assert_eq!(sorted, (0..N).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_size_builds_one() {
        let pool = ClientPool::new(0, |_| Ok(Client::lazy(ClientConfig::default()))).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let pool = ClientPool::from_clients(Vec::new());
        assert!(pool.next().is_none());
        let req = Request::new(
            http::Method::GET,
            url::Url::parse("http://example.com/").unwrap(),
        );
        assert!(matches!(
            pool.execute(req).await,
            Err(Error::NoAvailableClients)
        ));
    }

    #[test]
    fn test_with_proxies_rotates() {
        let base = ClientConfig::default();
        let pool = ClientPool::with_proxies(
            &["socks5://127.0.0.1:1080", "http://127.0.0.1:3128"],
            2,
            &base,
        )
        .unwrap();
        assert_eq!(pool.len(), 4);

        let ports: Vec<u16> = (0..4)
            .map(|_| pool.next().unwrap().proxy().unwrap().unwrap().port)
            .collect();
        assert_eq!(ports, vec![1080, 3128, 1080, 3128]);
    }

    #[test]
    fn test_with_proxy_shares_one_proxy() {
        let pool = ClientPool::with_proxy(3, "socks4a://10.0.0.1", &ClientConfig::default()).unwrap();
        for client in pool.clients() {
            assert_eq!(client.proxy().unwrap().unwrap().port, 1080);
        }
    }

    #[test]
    fn test_bad_proxy_in_list_fails() {
        let err = ClientPool::from_proxy_list(
            "127.0.0.1:3128\nftp://127.0.0.1:21",
            1,
            &ClientConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::UnsupportedProxyScheme(_)));

        assert!(matches!(
            ClientPool::from_proxy_list("# nothing here\n", 1, &ClientConfig::default()),
            Err(Error::NoAvailableClients)
        ));
    }
}
