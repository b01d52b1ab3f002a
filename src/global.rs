//! Process-wide default client.
//!
//! The default client is created lazily from [`ClientConfig::default`] and
//! can be replaced at any time. Replacing it never affects requests already
//! running on the previous client. Code that needs deterministic settings
//! should build and pass its own [`Client`].

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::Result;

use arc_swap::ArcSwap;
use bytes::Bytes;
use once_cell::sync::Lazy;
use reqwest::{Request, Response};
use std::sync::Arc;

static DEFAULT_CLIENT: Lazy<ArcSwap<Client>> =
    Lazy::new(|| ArcSwap::from_pointee(Client::lazy(ClientConfig::default())));

/// The current default client.
pub fn default_client() -> Arc<Client> {
    DEFAULT_CLIENT.load_full()
}

/// Replace the default client.
pub fn set_default_client(client: Client) {
    DEFAULT_CLIENT.store(Arc::new(client));
}

/// Replace the default client with one built from `config`.
///
/// On error the previous default stays in place.
pub fn set_default_config(config: ClientConfig) -> Result<()> {
    set_default_client(Client::new(config)?);
    Ok(())
}

/// Send `req` with the default client.
pub async fn execute(req: Request) -> Result<Response> {
    default_client().execute(req).await
}

pub async fn get(url: &str) -> Result<Response> {
    default_client().get(url).await
}

pub async fn post(url: &str, content_type: &str, body: impl Into<Bytes>) -> Result<Response> {
    default_client().post_bytes(url, content_type, body).await
}
