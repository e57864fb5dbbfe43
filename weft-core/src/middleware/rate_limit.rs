//! Request rate limiting with fixed-window and token-bucket strategies.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::middleware::{Entry, PRIORITY_RATE_LIMIT};

/// What the rate limit is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKey {
    /// Client address, from `X-Forwarded-For` or the peer address attribute.
    Ip,
    /// Authenticated user id attribute.
    User,
    /// `X-API-Key` header.
    ApiKey,
    /// Request path.
    Path,
}

#[derive(Debug, Clone, Copy)]
pub enum RateLimitStrategy {
    FixedWindow,
    TokenBucket,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window: Duration,
    pub key: RateLimitKey,
    pub strategy: RateLimitStrategy,
}

impl RateLimitConfig {
    pub fn fixed_window(max_requests: u64, window: Duration, key: RateLimitKey) -> Self {
        Self {
            max_requests,
            window,
            key,
            strategy: RateLimitStrategy::FixedWindow,
        }
    }

    pub fn token_bucket(max_requests: u64, window: Duration, key: RateLimitKey) -> Self {
        Self {
            max_requests,
            window,
            key,
            strategy: RateLimitStrategy::TokenBucket,
        }
    }
}

struct WindowSlot {
    window_start: Instant,
    count: u64,
}

struct BucketSlot {
    tokens: f64,
    last_refill: Instant,
}

/// Shared limiter state; clone-cheap, usable across services.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<DashMap<String, WindowSlot>>,
    buckets: Arc<DashMap<String, BucketSlot>>,
}

/// Outcome of one admission check.
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_after: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(DashMap::new()),
            buckets: Arc::new(DashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        match self.config.strategy {
            RateLimitStrategy::FixedWindow => self.check_window(key),
            RateLimitStrategy::TokenBucket => self.check_bucket(key),
        }
    }

    fn check_window(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut slot = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowSlot {
                window_start: now,
                count: 0,
            });
        if now.duration_since(slot.window_start) >= self.config.window {
            slot.window_start = now;
            slot.count = 0;
        }
        let reset_after = self
            .config
            .window
            .saturating_sub(now.duration_since(slot.window_start));
        if slot.count < self.config.max_requests {
            slot.count += 1;
            RateLimitDecision {
                allowed: true,
                remaining: self.config.max_requests - slot.count,
                reset_after,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after,
            }
        }
    }

    fn check_bucket(&self, key: &str) -> RateLimitDecision {
        let max_tokens = self.config.max_requests as f64;
        let now = Instant::now();
        let mut slot = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketSlot {
                tokens: max_tokens,
                last_refill: now,
            });
        let elapsed = now.duration_since(slot.last_refill);
        let refill = elapsed.as_secs_f64() / self.config.window.as_secs_f64() * max_tokens;
        slot.tokens = (slot.tokens + refill).min(max_tokens);
        slot.last_refill = now;

        if slot.tokens >= 1.0 {
            slot.tokens -= 1.0;
            RateLimitDecision {
                allowed: true,
                remaining: slot.tokens as u64,
                reset_after: self.config.window,
            }
        } else {
            // Seconds until one token is available again.
            let deficit = 1.0 - slot.tokens;
            let secs = deficit * self.config.window.as_secs_f64() / max_tokens;
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after: Duration::from_secs_f64(secs),
            }
        }
    }
}

fn extract_key(ctx: &crate::message::Context, kind: RateLimitKey) -> String {
    match kind {
        RateLimitKey::Ip => ctx
            .request()
            .headers
            .get("X-Forwarded-For")
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .or_else(|| ctx.attr_str("peer_addr").map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown".to_string()),
        RateLimitKey::User => ctx
            .attr_str("user_id")
            .unwrap_or("anonymous")
            .to_string(),
        RateLimitKey::ApiKey => ctx
            .request()
            .headers
            .get("X-API-Key")
            .unwrap_or("missing")
            .to_string(),
        RateLimitKey::Path => ctx.request().endpoint.clone(),
    }
}

/// Admission control middleware. Allowed requests carry
/// `X-RateLimit-Limit/Remaining/Reset` headers; rejected ones fail with the
/// RateLimited kind so the error handler renders 429 plus `Retry-After`.
pub fn rate_limit(config: RateLimitConfig) -> Entry {
    let limiter = RateLimiter::new(config.clone());
    Entry::new("rate_limit", PRIORITY_RATE_LIMIT, move |mut ctx, next| {
        let limiter = limiter.clone();
        let config = config.clone();
        Box::pin(async move {
            let key = extract_key(&ctx, config.key);
            let decision = limiter.check(&key);

            let headers = &mut ctx.response_mut().headers;
            headers.set("X-RateLimit-Limit", config.max_requests.to_string());
            headers.set("X-RateLimit-Remaining", decision.remaining.to_string());
            headers.set(
                "X-RateLimit-Reset",
                decision.reset_after.as_secs().to_string(),
            );

            if !decision.allowed {
                ctx.fail(Error::RateLimited {
                    message: "rate limit exceeded".into(),
                    retry_after_secs: decision.reset_after.as_secs().max(1),
                });
                return ctx;
            }
            next.run(ctx).await
        })
    })
}
