//! Token-bucket rate limiter
//!
//! A single refill task tops the bucket up periodically; any number of
//! consumers take tokens, either blocking (refresher work) or opportunistic
//! (upstream gate on the miss path). The bucket depth is the burst, roughly
//! a tenth of the per-second rate, so a consumer can never pull more than one
//! refill period ahead of the configured rate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::shutdown::Shutdown;

/// Refill period; burst = rate / refills-per-second
const REFILL_PERIOD: Duration = Duration::from_millis(100);
const REFILLS_PER_SEC: u32 = 10;

/// Multi-consumer token bucket
pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    burst: usize,
}

impl RateLimiter {
    /// Create a limiter issuing `rate` tokens per second and spawn its refill
    /// task. The bucket starts full.
    pub fn new(rate: u32, shutdown: Shutdown) -> Arc<Self> {
        let burst = (rate / REFILLS_PER_SEC).max(1) as usize;
        let limiter = Arc::new(Self {
            tokens: Arc::new(Semaphore::new(burst)),
            burst,
        });

        let tokens = Arc::clone(&limiter.tokens);
        let top = burst;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REFILL_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {
                        let missing = top.saturating_sub(tokens.available_permits());
                        if missing > 0 {
                            tokens.add_permits(missing);
                        }
                    }
                }
            }
        });

        limiter
    }

    /// Wait for one token. Returns `false` when the shutdown fired first.
    pub async fn acquire(&self, shutdown: &Shutdown) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            permit = self.tokens.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
        }
    }

    /// Take a token without waiting. Used by the upstream gate; an empty
    /// bucket there becomes a 429 at the HTTP boundary.
    pub fn try_acquire(&self) -> bool {
        match self.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn burst(&self) -> usize {
        self.burst
    }
}

// =============================================================================
// Tests
// =============================================================================
