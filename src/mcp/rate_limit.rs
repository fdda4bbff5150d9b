//! Fixed-window rate limiting.

use async_trait::async_trait;
use dashmap::DashMap;
use std::borrow::Borrow;
use std::fmt::Display;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::mcp::handler::RequestFilter;
use crate::mcp::protocol::JsonRpcRequest;

struct Window {
    start: Instant,
    count: u32,
}

/// Per-key fixed-window counter.
pub struct RateLimiter<K = String> {
    windows: DashMap<K, Window>,
    limit: u32,
    window: Duration,
}

impl<K: Eq + Hash> RateLimiter<K> {
    /// Create a limiter admitting `limit` events per `window` for each key.
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(Error::Config("rate limit must be positive".to_string()));
        }
        if window.is_zero() {
            return Err(Error::Config("rate window must be positive".to_string()));
        }
        Ok(Self {
            windows: DashMap::new(),
            limit,
            window,
        })
    }

    pub fn per_second(limit: u32) -> Result<Self> {
        Self::new(limit, Duration::from_secs(1))
    }

    /// Consume one unit of allowance for `key`.
    pub fn check<Q>(&self, key: &Q) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Display + ToOwned<Owned = K> + ?Sized,
    {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(key.to_owned())
            .or_insert_with(|| Window { start: now, count: 0 });

        if now.duration_since(window.start) >= self.window {
            window.start = now;
            window.count = 0;
        }
        if window.count >= self.limit {
            return Err(Error::RateLimited(format!("Rate limit exceeded: {}", key)));
        }
        window.count += 1;
        Ok(())
    }

    /// Forget the window for `key`.
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.windows.remove(key);
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// Request filter that throttles each method independently.
pub struct MethodRateLimit {
    limiter: RateLimiter,
}

impl MethodRateLimit {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl RequestFilter for MethodRateLimit {
    async fn check(&self, request: &JsonRpcRequest) -> Result<()> {
        self.limiter.check(&request.method)
    }
}
