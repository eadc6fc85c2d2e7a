//! Rate limiting for the node API.
//!
//! Each stream gets its own limiter, parameterised by message class. Callers
//! invoke `limit(class, count)` before doing work; exceeding budget maps to
//! `ResourceExhausted` at the RPC edge.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Classes of rate-limited node API messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// One permit per attestation stream.
    Attest,
    /// One permit per CSR in a fetch request.
    Csr,
    /// One permit per JWT-SVID request.
    Jsr,
}

/// Budget exceeded for a message class.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limit exceeded for {class:?} messages")]
pub struct RateLimited {
    pub class: MessageClass,
}

/// A per-stream limiter. Streams are single-owner, so implementations need
/// no cross-stream coordination.
pub trait StreamLimiter: Send + Sync {
    fn limit(&self, class: MessageClass, count: u32) -> Result<(), RateLimited>;
}

/// Factory handing each stream its own limiter.
pub trait RateLimits: Send + Sync {
    fn new_stream(&self) -> Box<dyn StreamLimiter>;
}

/// Quota for one message class: sustained rate plus burst headroom.
#[derive(Debug, Clone, Copy)]
pub struct ClassQuota {
    pub per_second: u32,
    pub burst: u32,
}

impl ClassQuota {
    fn to_quota(self) -> Quota {
        let per_second = NonZeroU32::new(self.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        Quota::per_second(per_second).allow_burst(burst)
    }
}

/// Default leaky-bucket limits.
#[derive(Debug, Clone, Copy)]
pub struct LeakyBucketLimits {
    pub attest: ClassQuota,
    pub csr: ClassQuota,
    pub jsr: ClassQuota,
}

impl Default for LeakyBucketLimits {
    fn default() -> Self {
        Self {
            attest: ClassQuota {
                per_second: 1,
                burst: 2,
            },
            csr: ClassQuota {
                per_second: 20,
                burst: 200,
            },
            jsr: ClassQuota {
                per_second: 20,
                burst: 200,
            },
        }
    }
}

impl RateLimits for LeakyBucketLimits {
    fn new_stream(&self) -> Box<dyn StreamLimiter> {
        Box::new(BucketStreamLimiter {
            attest: Arc::new(RateLimiter::direct(self.attest.to_quota())),
            csr: Arc::new(RateLimiter::direct(self.csr.to_quota())),
            jsr: Arc::new(RateLimiter::direct(self.jsr.to_quota())),
        })
    }
}

type Bucket = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

struct BucketStreamLimiter {
    attest: Bucket,
    csr: Bucket,
    jsr: Bucket,
}

impl StreamLimiter for BucketStreamLimiter {
    fn limit(&self, class: MessageClass, count: u32) -> Result<(), RateLimited> {
        let Some(count) = NonZeroU32::new(count) else {
            return Ok(());
        };
        let bucket = match class {
            MessageClass::Attest => &self.attest,
            MessageClass::Csr => &self.csr,
            MessageClass::Jsr => &self.jsr,
        };
        match bucket.check_n(count) {
            Ok(Ok(())) => Ok(()),
            _ => {
                tracing::warn!(?class, count, "Rate limit exceeded");
                Err(RateLimited { class })
            }
        }
    }
}
