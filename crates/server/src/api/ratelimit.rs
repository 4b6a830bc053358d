//! Sliding-window rate limiting by source IP.
//!
//! Applied as a tower layer at the HTTP entry; the publish and admin routes
//! carry a second, stricter instance. Rejections are `429` with a
//! `Retry-After` header and the standard error envelope.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use futures::future::BoxFuture;
use tower::Layer;

use repub_api::error::{ErrorCode, ErrorEnvelope};

/// Buckets beyond this trigger a prune of idle sources.
const PRUNE_THRESHOLD: usize = 10_000;

pub struct RateLimiter {
    max: u32,
    window: Duration,
    buckets: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            max: max.max(1),
            window,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Admits or rejects one request from `ip`; rejections return the number
    /// of seconds after which a retry can succeed.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if buckets.len() > PRUNE_THRESHOLD {
            let window = self.window;
            buckets.retain(|_, hits| {
                hits.back().is_some_and(|last| now - *last < window)
            });
        }

        let hits = buckets.entry(ip).or_default();
        while hits
            .front()
            .is_some_and(|first| now.duration_since(*first) >= self.window)
        {
            hits.pop_front();
        }

        if hits.len() >= self.max as usize {
            let oldest = *hits.front().expect("max is at least 1");
            let retry_after = (self.window - now.duration_since(oldest)).as_secs().max(1);
            return Err(retry_after);
        }

        hits.push_back(now);
        Ok(())
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> tower::Service<Request<Body>> for RateLimitService<S>
where
    S: tower::Service<Request<Body>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let source = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());

        if let Some(ip) = source {
            if let Err(retry_after) = self.limiter.check(ip) {
                return Box::pin(async move {
                    let body = serde_json::to_vec(&ErrorEnvelope::new(
                        ErrorCode::RateLimited,
                        "rate limit exceeded",
                    ))
                    .unwrap_or_default();
                    Ok(Response::builder()
                        .status(StatusCode::TOO_MANY_REQUESTS)
                        .header(header::RETRY_AFTER, retry_after)
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(body))
                        .unwrap())
                });
            }
        }

        Box::pin(self.inner.call(req))
    }
}
