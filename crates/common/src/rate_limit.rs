use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};

/// Per-IP token bucket. Refills continuously; `tokens` is stored as
/// milli-tokens (x1000) so refill math stays integer.
struct Bucket {
    milli_tokens: AtomicI64,
    last_refill: std::sync::Mutex<Instant>,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        Self {
            milli_tokens: AtomicI64::new(burst as i64 * 1000),
            last_refill: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Try to take one token. Returns true if allowed.
    fn try_take(&self, rps: u32, burst: u32) -> bool {
        let now = Instant::now();
        let elapsed = {
            let mut last = self.last_refill.lock().unwrap();
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed
        };

        let refill_milli = (elapsed.as_secs_f64() * rps as f64 * 1000.0) as i64;
        let cap_milli = burst as i64 * 1000;
        let current = self.milli_tokens.fetch_add(refill_milli, Ordering::Relaxed) + refill_milli;
        if current > cap_milli {
            self.milli_tokens.store(cap_milli, Ordering::Relaxed);
        }

        let mut cur = self.milli_tokens.load(Ordering::Relaxed);
        loop {
            if cur < 1000 {
                return false;
            }
            match self.milli_tokens.compare_exchange_weak(
                cur,
                cur - 1000,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn idle_for(&self) -> Duration {
        Instant::now().duration_since(*self.last_refill.lock().unwrap())
    }
}

/// A `tower::Layer` applying a per-client-IP token-bucket rate limit.
/// Clients over budget receive `429 Too Many Requests`.
#[derive(Clone)]
pub struct RateLimitLayer {
    buckets: Arc<DashMap<IpAddr, Bucket>>,
    rps: u32,
    burst: u32,
}

impl RateLimitLayer {
    pub fn new(rps: u32, burst: u32) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            rps,
            burst,
        }
    }

    fn allow(&self, ip: IpAddr) -> bool {
        let bucket = self
            .buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(self.burst));
        bucket.try_take(self.rps, self.burst)
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: RateLimitLayer,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let ip = req
            .extensions()
            .get::<ConnectInfo<std::net::SocketAddr>>()
            .map(|ci| ci.0.ip())
            .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));

        if !self.limiter.allow(ip) {
            tracing::warn!(%ip, "rate limit exceeded");
            return Box::pin(async move {
                Ok((StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response())
            });
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await })
    }
}

/// Periodically evict buckets that have been idle for longer than 10 minutes,
/// so long-lived processes don't accumulate one entry per ever-seen client IP.
pub fn spawn_cleanup_task(
    limiter: RateLimitLayer,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let stale_after = Duration::from_secs(600);
                    limiter.buckets.retain(|_, b| b.idle_for() < stale_after);
                }
            }
        }
        tracing::debug!("rate limit cleanup task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_within_burst() {
        let limiter = RateLimitLayer::new(1, 3);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn tracks_ips_independently() {
        let limiter = RateLimitLayer::new(1, 1);
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.allow(a));
        assert!(!limiter.allow(a));
        assert!(limiter.allow(b));
    }
}
