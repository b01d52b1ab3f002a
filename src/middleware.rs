//! Middleware implementation for reqwest.

use crate::pool::ClientPool;

use anyhow::anyhow;
use async_trait::async_trait;
use log::debug;
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;

/// Middleware that sends every request through a [`ClientPool`].
///
/// The request leaves through the pool's own transports, so the rest of the
/// middleware chain is not called.
#[derive(Clone)]
pub struct PoolMiddleware {
    pool: Arc<ClientPool>,
}

impl PoolMiddleware {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }
}

#[async_trait]
impl Middleware for PoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        debug!("Dispatching {} {} through client pool", req.method(), req.url());
        self.pool
            .execute(req)
            .await
            .map_err(|e| Error::Middleware(anyhow!(e)))
    }
}
