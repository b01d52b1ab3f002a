//! # reqwest-tunnel-pool
//!
//! An HTTP client toolkit built around `reqwest` request and response types.
//!
//! Every [`Client`] owns its own pooled HTTP/1.1 + HTTP/2 transport that
//! connects directly, through an HTTP(S) forward proxy, or through a SOCKS4,
//! SOCKS4a or SOCKS5 tunnel negotiated by this crate. Requests run through a
//! retry loop that only repeats idempotent requests with replayable bodies.
//! A [`ClientPool`] spreads requests over many clients (and proxies) in
//! round-robin order, and can be plugged into `reqwest-middleware` with
//! [`PoolMiddleware`]. HTTP/3 can be enabled for clients without a proxy.

mod body;
pub mod client;
pub mod config;
mod connect;
pub mod error;
pub mod global;
mod http3;
pub mod middleware;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod socks;
mod tls;
mod transport;
mod utils;

pub use client::Client;
pub use config::{ClientConfig, ClientConfigBuilder, Hooks};
pub use error::{Error, Result};
pub use middleware::PoolMiddleware;
pub use pool::ClientPool;
pub use proxy::{ProxyScheme, ProxyTarget};
