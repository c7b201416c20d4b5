//! Per-(caller, capability) token buckets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use amp_primitives::{Capability, RateLimit};
use dashmap::DashMap;
use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DashMapStateStore};
use tracing::warn;

use crate::{RuntimeError, RuntimeResult};

type KeyedRateLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

struct Bucket {
    limit: RateLimit,
    limiter: KeyedRateLimiter,
}

impl Bucket {
    fn new(limit: RateLimit) -> Arc<Self> {
        Arc::new(Self {
            limit,
            limiter: RateLimiter::keyed(quota(limit)),
        })
    }
}

/// GCRA buckets of burst `requests` replenished over `window_ms`, one
/// limiter per capability version keyed by caller.
#[derive(Default)]
pub struct RateLimits {
    buckets: DashMap<String, Arc<Bucket>>,
}

impl fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimits")
            .field("capabilities", &self.buckets.len())
            .finish()
    }
}

impl RateLimits {
    /// Creates an empty set of buckets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one token for `agent` on `capability`.
    ///
    /// Capabilities without a declared rate limit always pass.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::RateLimited`] when the bucket is empty.
    pub fn check(&self, agent: &str, capability: &Capability) -> RuntimeResult<()> {
        let Some(limit) = capability.constraints().rate_limit else {
            return Ok(());
        };
        let bucket = self.bucket(capability, limit);
        bucket.limiter.check_key(&agent.to_owned()).map_err(|_| {
            warn!(agent, capability = %capability.id(), "rate limit exceeded");
            RuntimeError::RateLimited {
                agent: agent.to_owned(),
                capability: capability.id().to_string(),
            }
        })
    }

    /// Drops per-caller state that has fully replenished.
    pub fn retain_recent(&self) {
        for bucket in &self.buckets {
            bucket.limiter.retain_recent();
        }
    }

    fn bucket(&self, capability: &Capability, limit: RateLimit) -> Arc<Bucket> {
        let key = format!("{}@{}", capability.id(), capability.version());
        if let Some(bucket) = self.buckets.get(&key) {
            if bucket.limit == limit {
                return Arc::clone(&bucket);
            }
        }
        let mut entry = self.buckets.entry(key).or_insert_with(|| Bucket::new(limit));
        if entry.limit != limit {
            *entry = Bucket::new(limit);
        }
        Arc::clone(&entry)
    }
}

fn quota(limit: RateLimit) -> Quota {
    let period = (Duration::from_millis(limit.window_ms) / limit.requests.get())
        .max(Duration::from_nanos(1));
    Quota::with_period(period).map_or_else(
        || Quota::per_second(limit.requests),
        |quota| quota.allow_burst(limit.requests),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    use amp_primitives::{CapabilityConstraints, CapabilityId};

    fn capability(requests: u32) -> Capability {
        Capability::builder(CapabilityId::new("translate").unwrap())
            .version("1.0.0")
            .unwrap()
            .constraints(CapabilityConstraints {
                rate_limit: Some(RateLimit {
                    requests: NonZeroU32::new(requests).unwrap(),
                    window_ms: 60_000,
                }),
                ..CapabilityConstraints::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn bucket_of_n_rejects_n_plus_one() {
        let limits = RateLimits::new();
        let cap = capability(3);
        for _ in 0..3 {
            limits.check("agent-a", &cap).unwrap();
        }
        assert!(matches!(
            limits.check("agent-a", &cap),
            Err(RuntimeError::RateLimited { .. })
        ));
        // Other callers have their own bucket.
        limits.check("agent-b", &cap).unwrap();
    }

    #[test]
    fn unlimited_capabilities_always_pass() {
        let limits = RateLimits::new();
        let cap = Capability::builder(CapabilityId::new("echo").unwrap())
            .version("1.0.0")
            .unwrap()
            .build()
            .unwrap();
        for _ in 0..100 {
            limits.check("agent-a", &cap).unwrap();
        }
    }

    #[test]
    fn changed_limit_replaces_bucket() {
        let limits = RateLimits::new();
        limits.check("agent-a", &capability(1)).unwrap();
        assert!(limits.check("agent-a", &capability(1)).is_err());
        limits.check("agent-a", &capability(2)).unwrap();
    }
}
