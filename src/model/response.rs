//! Cache entry
//!
//! A `Response` is the long-lived object the sharded map and the recency
//! lists share. Readers never lock an entry: the payload and the canonical
//! request sit behind atomic pointer swaps, and everything else the hot path
//! touches (`weight`, `revalidated_at`, the recency-node handle) is a plain
//! atomic. Revalidation replaces the payload pointer wholesale, so a reader
//! observes either the old or the new payload, never a mix.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use futures::future::BoxFuture;

use crate::config::Config;
use crate::error::Result;
use crate::model::data::Data;
use crate::model::request::Request;

/// Sentinel for "not registered in any recency list"
pub const RECENCY_NONE: u64 = u64::MAX;

/// Future returned by a revalidator closure
pub type DataFuture = BoxFuture<'static, Result<Data>>;

/// Closure that fetches fresh payload from the upstream using the entry's
/// canonical request. Built once per entry; carries its own timeout.
pub type Revalidator = Arc<dyn Fn() -> DataFuture + Send + Sync>;

/// A cache entry: payload, canonical request, and refresh bookkeeping
pub struct Response {
    cfg: Arc<Config>,
    data: ArcSwap<Data>,
    request: ArcSwap<Request>,
    revalidator: Revalidator,
    /// Handle of this entry's node in its shard's recency list
    recency_node: AtomicU64,
    /// Approximate in-memory size in bytes
    weight: AtomicI64,
    /// Nanoseconds since epoch of the last successful revalidation
    revalidated_at: AtomicI64,
    /// At most one revalidation may be in flight per entry
    refresh_inflight: AtomicBool,
}

impl Response {
    pub fn new(
        cfg: Arc<Config>,
        data: Data,
        request: Arc<Request>,
        revalidator: Revalidator,
    ) -> Arc<Self> {
        let weight =
            std::mem::size_of::<Self>() as i64 + data.weight() + request.weight();
        Arc::new(Self {
            cfg,
            data: ArcSwap::from_pointee(data),
            request: ArcSwap::new(request),
            revalidator,
            recency_node: AtomicU64::new(RECENCY_NONE),
            weight: AtomicI64::new(weight),
            revalidated_at: AtomicI64::new(now_nanos()),
            refresh_inflight: AtomicBool::new(false),
        })
    }

    /// Current payload
    pub fn data(&self) -> Arc<Data> {
        self.data.load_full()
    }

    /// Canonical request this entry is keyed by
    pub fn request(&self) -> Arc<Request> {
        self.request.load_full()
    }

    #[inline]
    pub fn map_key(&self) -> u64 {
        self.request.load().map_key()
    }

    #[inline]
    pub fn shard_key(&self) -> u64 {
        self.request.load().shard_key()
    }

    #[inline]
    pub fn weight(&self) -> i64 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn revalidated_at_nanos(&self) -> i64 {
        self.revalidated_at.load(Ordering::Relaxed)
    }

    /// Overwrite the revalidation timestamp. Restore and test support.
    pub fn set_revalidated_at_nanos(&self, nanos: i64) {
        self.revalidated_at.store(nanos, Ordering::Relaxed);
    }

    // -- Recency-list handle ---------------------------------------------------

    pub fn recency_node(&self) -> u64 {
        self.recency_node.load(Ordering::Acquire)
    }

    pub fn set_recency_node(&self, bits: u64) {
        self.recency_node.store(bits, Ordering::Release);
    }

    pub fn clear_recency_node(&self) {
        self.recency_node.store(RECENCY_NONE, Ordering::Release);
    }

    // -- Refresh ---------------------------------------------------------------

    /// Claim the single-flight refresh guard. The caller that gets `true`
    /// owns the revalidation and must call [`Response::end_refresh`] when it
    /// settles.
    pub fn try_begin_refresh(&self) -> bool {
        self.refresh_inflight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_refresh(&self) {
        self.refresh_inflight.store(false, Ordering::Release);
    }

    /// Fetch fresh payload through the revalidator and swap it in, adjusting
    /// the weight by the payload delta and bumping `revalidated_at`. On error
    /// the stale payload is retained untouched.
    pub async fn revalidate(&self) -> Result<()> {
        let fresh = (self.revalidator)().await?;
        let delta = {
            let fresh = Arc::new(fresh);
            let old = self.data.swap(Arc::clone(&fresh));
            fresh.weight() - old.weight()
        };
        self.weight.fetch_add(delta, Ordering::Relaxed);
        self.revalidated_at.store(now_nanos(), Ordering::Relaxed);
        Ok(())
    }

    /// Probabilistic early-expiration test (the β-algorithm).
    ///
    /// Below `min_stale` the entry is never refreshed. Past it, the refresh
    /// probability climbs toward 1 as the age approaches and passes the TTL,
    /// which spreads revalidations around the expiry boundary instead of
    /// letting them synchronize into an upstream stampede. Non-2xx entries
    /// run on a tenth of both the TTL and `min_stale`, so error responses
    /// refresh roughly ten times sooner.
    pub fn should_be_refreshed(&self) -> bool {
        let data = self.data.load();
        let request = self.request.load();
        let refresh = &self.cfg.cache.refresh;

        let rule = request.rule();
        let mut beta = rule.map(|r| r.beta).unwrap_or(0.0);
        let mut interval = rule.map(|r| r.ttl).unwrap_or(Duration::ZERO);
        let mut min_stale = rule.map(|r| r.min_stale).unwrap_or(Duration::ZERO);

        if beta.abs() < f64::EPSILON {
            beta = refresh.beta;
        }
        if beta.abs() < f64::EPSILON {
            return false;
        }
        if interval.is_zero() {
            interval = refresh.ttl;
        }
        if interval.is_zero() {
            return false;
        }
        if min_stale.is_zero() {
            min_stale = refresh.min_stale;
        }

        if !data.is_success() {
            interval /= 10;
            min_stale /= 10;
        }

        let age = now_nanos().saturating_sub(self.revalidated_at.load(Ordering::Relaxed));
        if age <= min_stale.as_nanos() as i64 {
            return false;
        }

        let ratio = age as f64 / interval.as_nanos() as f64;
        rand::random::<f64>() >= (-beta * ratio).exp()
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("key", &self.map_key())
            .field("shard", &self.shard_key())
            .field("status", &self.data.load().status())
            .field("weight", &self.weight())
            .finish()
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheKeySection, RuleConfig};
    use std::sync::atomic::AtomicU32;

    fn test_config(ttl: Duration, beta: f64) -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.cache.rules = vec![RuleConfig {
            path: "/api".to_string(),
            ttl,
            beta,
            cache_key: CacheKeySection {
                query: vec!["id".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }];
        cfg.finish().unwrap();
        Arc::new(cfg)
    }

    fn noop_revalidator(status: u16, body: &'static [u8]) -> Revalidator {
        Arc::new(move || {
            Box::pin(async move { Ok(Data::from_stored(status, vec![], body.to_vec())) })
        })
    }

    fn entry(cfg: &Arc<Config>, status: u16) -> Arc<Response> {
        let request = Request::new(
            cfg,
            b"/api",
            &[(b"id".to_vec(), b"1".to_vec())],
            &[],
        )
        .unwrap();
        let rule = cfg.rules[0].clone();
        let data = Data::new(&rule, status, vec![], b"payload".to_vec());
        Response::new(Arc::clone(cfg), data, Arc::new(request), noop_revalidator(200, b"fresh"))
    }

    fn backdate(resp: &Response, age: Duration) {
        resp.set_revalidated_at_nanos(now_nanos() - age.as_nanos() as i64);
    }

    #[test]
    fn test_fresh_entry_is_never_refreshed() {
        let cfg = test_config(Duration::from_secs(3600), 0.5);
        let resp = entry(&cfg, 200);
        for _ in 0..100 {
            assert!(!resp.should_be_refreshed());
        }
    }

    #[test]
    fn test_age_below_min_stale_is_never_refreshed() {
        let cfg = test_config(Duration::from_secs(3600), 0.5);
        let resp = entry(&cfg, 200);
        // min_stale = 30 min; stay just below it
        backdate(&resp, Duration::from_secs(29 * 60));
        for _ in 0..100 {
            assert!(!resp.should_be_refreshed());
        }
    }

    #[test]
    fn test_far_past_ttl_refreshes_almost_surely() {
        let cfg = test_config(Duration::from_secs(60), 1.0);
        let resp = entry(&cfg, 200);
        backdate(&resp, Duration::from_secs(60 * 100));
        let refreshed = (0..100).filter(|_| resp.should_be_refreshed()).count();
        assert_eq!(refreshed, 100);
    }

    #[test]
    fn test_zero_beta_disables_refresh() {
        let mut cfg = Config::default();
        cfg.cache.refresh.beta = 0.0;
        cfg.cache.rules = vec![RuleConfig {
            path: "/api".to_string(),
            ttl: Duration::from_secs(60),
            cache_key: CacheKeySection { query: vec!["id".to_string()], ..Default::default() },
            ..Default::default()
        }];
        cfg.finish().unwrap();
        let cfg = Arc::new(cfg);
        let resp = entry(&cfg, 200);
        backdate(&resp, Duration::from_secs(60 * 1000));
        for _ in 0..100 {
            assert!(!resp.should_be_refreshed());
        }
    }

    #[test]
    fn test_error_entries_refresh_sooner() {
        // TTL = 1h, beta = 0.5: errors run on TTL/10, so min_stale = 3 min.
        let cfg = test_config(Duration::from_secs(3600), 0.5);
        let err = entry(&cfg, 500);

        backdate(&err, Duration::from_secs(2 * 60));
        for _ in 0..50 {
            assert!(!err.should_be_refreshed());
        }

        // At 7 minutes a meaningful share of draws refresh.
        backdate(&err, Duration::from_secs(7 * 60));
        let refreshed = (0..2000).filter(|_| err.should_be_refreshed()).count();
        assert!(refreshed > 600, "expected a meaningful refresh share, got {refreshed}/2000");

        // A 2xx entry of the same age is far below its min_stale.
        let ok = entry(&cfg, 200);
        backdate(&ok, Duration::from_secs(7 * 60));
        assert!(!ok.should_be_refreshed());
    }

    #[test]
    fn test_error_ttl_does_not_enter_the_refresh_formula() {
        // A configured error_ttl never changes the β timing: errors always
        // run on TTL/10 and min_stale/10.
        let mut cfg = Config::default();
        cfg.cache.rules = vec![RuleConfig {
            path: "/api".to_string(),
            ttl: Duration::from_secs(3600),
            error_ttl: Duration::from_secs(30 * 60),
            beta: 0.5,
            cache_key: CacheKeySection {
                query: vec!["id".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }];
        cfg.finish().unwrap();
        let cfg = Arc::new(cfg);

        let err = entry(&cfg, 500);

        // Still inside the TTL/10 min_stale (3 min): never refreshed.
        backdate(&err, Duration::from_secs(2 * 60));
        assert!((0..200).all(|_| !err.should_be_refreshed()));

        // Past it: draws refresh. Had error_ttl driven the formula, the
        // min_stale would be 15 min and nothing would refresh at 7 minutes.
        backdate(&err, Duration::from_secs(7 * 60));
        let refreshed = (0..2000).filter(|_| err.should_be_refreshed()).count();
        assert!(refreshed > 600, "only {refreshed}/2000 draws refreshed");
    }

    #[tokio::test]
    async fn test_revalidate_swaps_data_and_bumps_timestamp() {
        let cfg = test_config(Duration::from_secs(3600), 0.5);
        let resp = entry(&cfg, 500);
        backdate(&resp, Duration::from_secs(600));

        let before_ts = resp.revalidated_at_nanos();
        let before_weight = resp.weight();
        let old_data = resp.data();

        resp.revalidate().await.unwrap();

        let new_data = resp.data();
        assert!(!Arc::ptr_eq(&old_data, &new_data));
        assert_eq!(new_data.status(), 200);
        assert_eq!(new_data.body().as_ref(), b"fresh");
        assert!(resp.revalidated_at_nanos() > before_ts);
        assert_eq!(resp.weight(), before_weight + (new_data.weight() - old_data.weight()));
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_stale_data() {
        let cfg = test_config(Duration::from_secs(3600), 0.5);
        let request =
            Request::new(&cfg, b"/api", &[(b"id".to_vec(), b"1".to_vec())], &[]).unwrap();
        let rule = cfg.rules[0].clone();
        let data = Data::new(&rule, 200, vec![], b"stale".to_vec());
        let failing: Revalidator = Arc::new(|| {
            Box::pin(async { Err(crate::error::Error::Upstream("boom".into())) })
        });
        let resp = Response::new(Arc::clone(&cfg), data, Arc::new(request), failing);

        let before = resp.data();
        assert!(resp.revalidate().await.is_err());
        assert!(Arc::ptr_eq(&before, &resp.data()));
    }

    #[test]
    fn test_single_flight_guard() {
        let cfg = test_config(Duration::from_secs(3600), 0.5);
        let resp = entry(&cfg, 200);

        assert!(resp.try_begin_refresh());
        assert!(!resp.try_begin_refresh());
        resp.end_refresh();
        assert!(resp.try_begin_refresh());
        resp.end_refresh();
    }

    #[tokio::test]
    async fn test_readers_see_old_or_new_payload_never_a_mix() {
        let cfg = test_config(Duration::from_secs(3600), 0.5);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let revalidator: Revalidator = Arc::new(move || {
            let n = calls2.fetch_add(1, Ordering::Relaxed) + 1;
            Box::pin(async move {
                let body = format!("generation-{n}").into_bytes();
                Ok(Data::from_stored(200 + (n % 2) as u16, vec![], body))
            })
        });
        let request =
            Request::new(&cfg, b"/api", &[(b"id".to_vec(), b"1".to_vec())], &[]).unwrap();
        let rule = cfg.rules[0].clone();
        let data = Data::new(&rule, 200, vec![], b"generation-0".to_vec());
        let resp = Response::new(Arc::clone(&cfg), data, Arc::new(request), revalidator);

        let reader = {
            let resp = Arc::clone(&resp);
            tokio::spawn(async move {
                for _ in 0..2000 {
                    let data = resp.data();
                    // Status and body always come from the same payload.
                    let body = String::from_utf8(data.body().to_vec()).unwrap();
                    assert!(body.starts_with("generation-"));
                    let generation: u32 =
                        body.trim_start_matches("generation-").parse().unwrap();
                    assert_eq!(data.status(), 200 + (generation % 2) as u16);
                }
            })
        };

        for _ in 0..50 {
            resp.revalidate().await.unwrap();
        }
        reader.await.unwrap();
    }

    #[test]
    fn test_recency_handle_roundtrip() {
        let cfg = test_config(Duration::from_secs(3600), 0.5);
        let resp = entry(&cfg, 200);
        assert_eq!(resp.recency_node(), RECENCY_NONE);
        resp.set_recency_node(42);
        assert_eq!(resp.recency_node(), 42);
        resp.clear_recency_node();
        assert_eq!(resp.recency_node(), RECENCY_NONE);
    }
}
