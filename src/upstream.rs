//! Upstream contract
//!
//! The engine never speaks HTTP itself. The embedder supplies an [`Upstream`]
//! implementation; the engine wraps it into per-entry revalidator closures
//! (carrying the configured per-request timeout) and gates miss-path fetches
//! through a token bucket so a cold cache cannot stampede the origin.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{Data, Request, Response, Revalidator};
use crate::rate::RateLimiter;
use crate::shutdown::Shutdown;

/// Origin fetcher: produce fresh payload for a canonical request.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Data>;
}

/// Build the revalidator closure for an entry: re-fetch through the upstream
/// with the configured timeout, using the entry's canonical request.
pub fn revalidator(
    upstream: Arc<dyn Upstream>,
    request: Arc<Request>,
    timeout: Duration,
) -> Revalidator {
    Arc::new(move || {
        let upstream = Arc::clone(&upstream);
        let request = Arc::clone(&request);
        Box::pin(async move {
            match tokio::time::timeout(timeout, upstream.fetch(&request)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Upstream(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        })
    })
}

/// Fetch a miss from the origin and build the cache entry, revalidator
/// attached.
pub async fn fetch_entry(
    cfg: &Arc<Config>,
    upstream: &Arc<dyn Upstream>,
    request: Arc<Request>,
) -> Result<Arc<Response>> {
    let timeout = cfg.cache.upstream.timeout;
    let data = match tokio::time::timeout(timeout, upstream.fetch(&request)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::Upstream(format!(
                "timed out after {}ms",
                timeout.as_millis()
            )))
        }
    };
    let revalidator = revalidator(Arc::clone(upstream), Arc::clone(&request), timeout);
    Ok(Response::new(Arc::clone(cfg), data, request, revalidator))
}

/// Token-bucket gate in front of the origin for miss fetches.
pub struct UpstreamGate {
    limiter: Arc<RateLimiter>,
}

impl UpstreamGate {
    pub fn new(rate: u32, shutdown: Shutdown) -> Self {
        Self {
            limiter: RateLimiter::new(rate, shutdown),
        }
    }

    /// Take one token or fail with [`Error::UpstreamRateExhausted`]; the
    /// HTTP boundary turns that into a 429.
    pub fn check(&self) -> Result<()> {
        if self.limiter.try_acquire() {
            Ok(())
        } else {
            Err(Error::UpstreamRateExhausted)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
