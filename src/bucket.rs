//! Leaky-bucket counter with quantized drainage.
//!
//! Each admitted unit raises the bucket's `level`; the level drains by
//! `drain_amount` once per whole `drain_period` that has elapsed since the
//! last drain. Partial periods are never applied, so the level is always an
//! exact integer function of the admitted units and the number of whole
//! periods observed. A bucket sustains `drain_amount / drain_period` with
//! bursts of up to `capacity`.

use std::fmt;
use std::time::{Duration, Instant};

/// Shape of a single bucket: burst size and sustained drain rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    /// Maximum level the bucket may reach.
    pub capacity: u64,
    /// Units removed from the level per elapsed `drain_period`.
    pub drain_amount: u64,
    /// Cadence of drainage.
    pub drain_period: Duration,
}

impl BucketConfig {
    /// A bucket draining `per_second` units every second.
    pub const fn per_second(capacity: u64, per_second: u64) -> Self {
        Self {
            capacity,
            drain_amount: per_second,
            drain_period: Duration::from_secs(1),
        }
    }
}

/// Returned when admitting a unit would push the bucket past its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketOverflow {
    pub level: u64,
    pub capacity: u64,
}

impl fmt::Display for BucketOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bucket full ({}/{})", self.level, self.capacity)
    }
}

impl std::error::Error for BucketOverflow {}

/// A single leaky bucket.
///
/// Buckets carry no synchronization of their own; the registry that owns
/// them provides exclusive access.
#[derive(Debug, Clone)]
pub struct Bucket {
    config: BucketConfig,
    level: u64,
    last_drain: Instant,
}

impl Bucket {
    /// Creates an empty bucket whose drain clock starts at `now`.
    pub fn new(config: BucketConfig, now: Instant) -> Self {
        Self {
            config,
            level: 0,
            last_drain: now,
        }
    }

    /// Current level, without applying any pending drainage.
    pub fn level(&self) -> u64 {
        self.level
    }

    /// Drains the bucket up to `now`, then admits `cost` units if they fit.
    ///
    /// On overflow the level is left exactly as the drain step set it.
    pub fn try_acquire(&mut self, cost: u64, now: Instant) -> Result<(), BucketOverflow> {
        self.drain(now);

        match self.level.checked_add(cost) {
            Some(next) if next <= self.config.capacity => {
                self.level = next;
                Ok(())
            }
            _ => Err(BucketOverflow {
                level: self.level,
                capacity: self.config.capacity,
            }),
        }
    }

    /// Returns `true` if the bucket would be empty after draining up to `now`.
    ///
    /// An empty bucket behaves exactly like a freshly created one, which is
    /// what makes it safe to discard.
    pub fn is_drained_at(&self, now: Instant) -> bool {
        let periods = self.whole_periods_since_drain(now);
        let drained = self.drained_units(periods);
        self.level <= drained
    }

    /// Applies all whole drain periods elapsed between `last_drain` and `now`.
    fn drain(&mut self, now: Instant) {
        if self.config.drain_period.is_zero() {
            self.level = 0;
            self.last_drain = now;
            return;
        }

        let periods = self.whole_periods_since_drain(now);
        if periods == 0 {
            return;
        }

        self.level = self.level.saturating_sub(self.drained_units(periods));

        // periods * drain_period <= elapsed, so this never passes `now`.
        let advance_nanos = periods * self.config.drain_period.as_nanos();
        self.last_drain += duration_from_nanos(advance_nanos);
    }

    fn whole_periods_since_drain(&self, now: Instant) -> u128 {
        let period = self.config.drain_period.as_nanos();
        if period == 0 {
            return u128::MAX;
        }
        now.saturating_duration_since(self.last_drain).as_nanos() / period
    }

    fn drained_units(&self, periods: u128) -> u64 {
        let drained = periods.saturating_mul(u128::from(self.config.drain_amount));
        u64::try_from(drained).unwrap_or(u64::MAX)
    }
}

fn duration_from_nanos(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}
