//! Per-key leaky-bucket registry.
//!
//! Maps a [`RateLimitKey`] (method + client identity) to its [`Bucket`],
//! creating buckets lazily on first sight. Storage is a sharded
//! [`DashMap`]: the drain-check-admit sequence for a key runs while holding
//! the write lock of that key's shard, so concurrent callers for the same
//! key are serialized while callers hashed to other shards are not. Bucket
//! mutation is O(1) and never blocks; nothing that sleeps or performs I/O
//! runs under a shard lock.
//!
//! Buckets whose level has fully drained can be pruned via
//! [`RateLimiterRegistry::retain_active`]. A drained bucket is
//! indistinguishable from a new one, so pruning never changes a decision.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use hyper::Method;

use crate::bucket::{Bucket, BucketConfig, BucketOverflow};
use crate::clock::{Clock, SystemClock};

/// Bucket shapes per method class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodLimits {
    /// Applied to `GET` requests.
    pub get: BucketConfig,
    /// Applied to every other method.
    pub other: BucketConfig,
}

impl MethodLimits {
    pub fn for_method(&self, method: &Method) -> BucketConfig {
        if method == Method::GET {
            self.get
        } else {
            self.other
        }
    }
}

impl Default for MethodLimits {
    fn default() -> Self {
        Self {
            get: BucketConfig::per_second(50, 8),
            other: BucketConfig::per_second(10, 1),
        }
    }
}

/// Identifies one bucket: the request method plus the client identity.
///
/// The identity is kept as raw header bytes so that distinct non-UTF-8
/// values never share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    method: Method,
    identity: Bytes,
}

impl RateLimitKey {
    pub fn new(method: Method, identity: impl Into<Bytes>) -> Self {
        Self {
            method,
            identity: identity.into(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.method,
            String::from_utf8_lossy(self.identity())
        )
    }
}

/// Concurrency-safe map from rate-limit key to bucket.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    buckets: DashMap<RateLimitKey, Bucket>,
    limits: MethodLimits,
    clock: Arc<dyn Clock>,
}

impl RateLimiterRegistry {
    /// Creates an empty registry driven by the system clock.
    pub fn new(limits: MethodLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: MethodLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            limits,
            clock,
        }
    }

    /// Charges one unit to the bucket for `key`, creating the bucket if this
    /// is the first request seen for it.
    pub fn acquire_for(&self, key: &RateLimitKey) -> Result<(), BucketOverflow> {
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(self.limits.for_method(key.method()), now));
        bucket.try_acquire(1, now)
    }

    /// Current level of the bucket for `key`, if one exists.
    pub fn level_of(&self, key: &RateLimitKey) -> Option<u64> {
        self.buckets.get(key).map(|bucket| bucket.level())
    }

    /// Removes every bucket that has drained back to empty.
    ///
    /// Returns the number of buckets removed.
    pub fn retain_active(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_drained_at(now));
        before.saturating_sub(self.buckets.len())
    }

    /// Number of keys currently holding a bucket.
    pub fn tracked_key_count(&self) -> usize {
        self.buckets.len()
    }
}
