//! Bounded response body reading with reusable buffers.

use crate::error::{Error, Result};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::Response;
use std::io;
use tokio::time::{timeout_at, Instant};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const BUFFER_CAPACITY: usize = 32 * 1024;
const MAX_POOLED: usize = 64;
/// Buffers that grew past this are not kept.
const MAX_RETAINED_CAPACITY: usize = 4 * 1024 * 1024;

/// A small free list of read buffers shared by one client.
#[derive(Default)]
pub(crate) struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub(crate) fn acquire(&self) -> BytesMut {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BUFFER_CAPACITY))
    }

    pub(crate) fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.free.lock().len()
    }
}

/// Read the whole body of `resp`.
///
/// With a `limit`, reading stops as soon as one byte more than `limit` has
/// arrived and [`Error::BodyTooLarge`] is returned.
pub(crate) async fn read_capped(
    mut resp: Response,
    limit: Option<u64>,
    pool: &BufferPool,
) -> Result<Bytes> {
    let mut buf = pool.acquire();
    let result = fill(&mut resp, limit, &mut buf).await;
    let body = result.map(|()| Bytes::copy_from_slice(&buf));
    pool.release(buf);
    body
}

async fn fill(resp: &mut Response, limit: Option<u64>, buf: &mut BytesMut) -> Result<()> {
    // one past the limit is enough to know it was exceeded
    let cap = limit.map(|l| l.saturating_add(1));
    while let Some(chunk) = resp.chunk().await.map_err(Error::Body)? {
        match cap {
            Some(cap) => {
                let room = (cap - buf.len() as u64) as usize;
                buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if buf.len() as u64 >= cap {
                    return Err(Error::BodyTooLarge {
                        limit: cap - 1,
                    });
                }
            }
            None => buf.extend_from_slice(&chunk),
        }
    }
    Ok(())
}

/// Turn a chunk stream into a response body that fails with a timed-out
/// io error once `deadline` passes.
pub(crate) fn with_deadline<S, E>(chunks: S, deadline: Option<Instant>) -> reqwest::Body
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError>,
{
    let Some(deadline) = deadline else {
        return reqwest::Body::wrap_stream(chunks);
    };
    let timed = futures::stream::unfold(Some(Box::pin(chunks)), move |state| async move {
        let mut chunks = state?;
        match timeout_at(deadline, chunks.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(chunks))),
            Ok(Some(Err(e))) => Some((Err(e.into()), None)),
            Ok(None) => None,
            Err(_) => {
                let elapsed = io::Error::new(io::ErrorKind::TimedOut, "response body deadline elapsed");
                Some((Err(BoxError::from(elapsed)), None))
            }
        }
    });
    reqwest::Body::wrap_stream(timed)
}
