//! Simple example of using reqwest-tunnel-pool.
//!
//! Pass proxies as arguments, e.g.
//! `cargo run --example simple -- socks5://127.0.0.1:9050 user:pass@10.0.0.2:3128`.
//! Without arguments requests go out directly.

use reqwest_middleware::ClientBuilder;
use reqwest_tunnel_pool::{ClientConfig, ClientPool, PoolMiddleware};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let proxies: Vec<String> = std::env::args().skip(1).collect();

    let base = ClientConfig::builder()
        .dial_timeout(Duration::from_secs(5))
        .max_attempts(3)
        .retry_backoff(Duration::from_millis(200))
        .max_response_body_size(1 << 20)
        .on_retry(|req, attempt, err| {
            println!("attempt {} for {} failed: {:?}", attempt, req.url(), err);
        })
        .build();

    println!("Building client pool...");
    let pool = if proxies.is_empty() {
        ClientPool::new(2, |_| reqwest_tunnel_pool::Client::new(base.clone()))?
    } else {
        ClientPool::with_proxies(&proxies, 2, &base)?
    };
    let pool = Arc::new(pool);

    // direct use of the pool
    for _ in 0..2 {
        let client = pool.next().ok_or("empty pool")?;
        let (body, status) = client.get_string("https://httpbin.org/ip").await?;
        println!("Status: {}", status);
        println!("Response: {}", body.trim());
    }

    // the same pool behind reqwest-middleware
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(PoolMiddleware::new(pool))
        .build();

    println!("Sending request through middleware...");
    let response = client.get("https://httpbin.org/ip").send().await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);

    Ok(())
}
