//! Randomized delay applied to throttled requests before they are answered.
//!
//! The delay is `|base + jitter|` milliseconds, where `jitter` is drawn from a
//! pluggable [`DelayDistribution`] (a seeded normal distribution in
//! production). Waiting goes through a [`Sleeper`] so the delay is an async
//! suspension point rather than a blocked thread, and so tests can skip it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TarpitConfig;

/// Source of the jitter term, in milliseconds. May return negative values.
pub trait DelayDistribution: Send + Sync + fmt::Debug {
    fn sample_millis(&self) -> f64;
}

/// Normally distributed jitter backed by a seedable PRNG.
#[derive(Debug)]
pub struct NormalJitter {
    mean: f64,
    std_dev: f64,
    rng: Mutex<StdRng>,
}

impl NormalJitter {
    /// Seeds the generator from the operating system.
    pub fn new(mean: f64, std_dev: f64) -> Self {
        Self::from_rng(mean, std_dev, StdRng::from_os_rng())
    }

    /// Uses a fixed seed, giving a reproducible sequence of samples.
    pub fn seeded(mean: f64, std_dev: f64, seed: u64) -> Self {
        Self::from_rng(mean, std_dev, StdRng::seed_from_u64(seed))
    }

    fn from_rng(mean: f64, std_dev: f64, rng: StdRng) -> Self {
        Self {
            mean,
            std_dev,
            rng: Mutex::new(rng),
        }
    }

    /// One standard normal variate via the Box-Muller transform.
    fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
        // u1 in (0, 1] keeps ln() finite.
        let u1 = 1.0 - rng.random::<f64>();
        let u2 = rng.random::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

impl DelayDistribution for NormalJitter {
    fn sample_millis(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        self.mean + Self::standard_normal(&mut *rng) * self.std_dev
    }
}

/// Always returns the same jitter.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl DelayDistribution for FixedJitter {
    fn sample_millis(&self) -> f64 {
        self.0
    }
}

/// Abstraction for sleeping/waiting.
pub trait Sleeper: Send + Sync + fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Sleeper that records every requested duration and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        Box::pin(async {})
    }
}

/// Computes and applies the throttling delay.
#[derive(Debug, Clone)]
pub struct Tarpit {
    base_millis: f64,
    jitter: Arc<dyn DelayDistribution>,
    sleeper: Arc<dyn Sleeper>,
}

impl Tarpit {
    pub fn new(
        base_millis: f64,
        jitter: Arc<dyn DelayDistribution>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            base_millis,
            jitter,
            sleeper,
        }
    }

    /// A tarpit that never waits.
    pub fn disabled() -> Self {
        Self::new(0.0, Arc::new(FixedJitter(0.0)), Arc::new(InstantSleeper))
    }

    /// Builds the production tarpit: normal jitter and the tokio timer.
    pub fn from_config(config: &TarpitConfig) -> Self {
        let mean = config.jitter_mean_ms as f64;
        let std_dev = config.jitter_std_dev_ms as f64;
        let jitter = match config.seed {
            Some(seed) => NormalJitter::seeded(mean, std_dev, seed),
            None => NormalJitter::new(mean, std_dev),
        };
        Self::new(
            config.base_ms as f64,
            Arc::new(jitter),
            Arc::new(TokioSleeper),
        )
    }

    /// Draws the next delay. Always non-negative, truncated to whole milliseconds.
    pub fn compute_delay(&self) -> Duration {
        let millis = (self.base_millis + self.jitter.sample_millis()).abs();
        // NaN saturates to 0 and +inf to u64::MAX under `as`.
        Duration::from_millis(millis as u64)
    }

    /// Draws a delay and waits it out, returning what was applied.
    pub async fn apply(&self) -> Duration {
        let delay = self.compute_delay();
        self.sleeper.sleep(delay).await;
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tarpit_with(jitter: impl DelayDistribution + 'static) -> Tarpit {
        Tarpit::new(100.0, Arc::new(jitter), Arc::new(InstantSleeper))
    }

    #[test]
    fn fixed_jitter_adds_to_base() {
        assert_eq!(
            tarpit_with(FixedJitter(500.0)).compute_delay(),
            Duration::from_millis(600)
        );
    }

    #[test]
    fn negative_sum_is_reflected_not_clamped() {
        assert_eq!(
            tarpit_with(FixedJitter(-350.0)).compute_delay(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn nan_jitter_yields_zero_delay() {
        assert_eq!(
            tarpit_with(FixedJitter(f64::NAN)).compute_delay(),
            Duration::ZERO
        );
    }

    #[test]
    fn seeded_jitter_is_reproducible() {
        let a = NormalJitter::seeded(500.0, 100.0, 7);
        let b = NormalJitter::seeded(500.0, 100.0, 7);
        for _ in 0..32 {
            assert_eq!(a.sample_millis(), b.sample_millis());
        }
    }

    #[test]
    fn normal_delay_is_centred_near_600ms() {
        let tarpit = tarpit_with(NormalJitter::seeded(500.0, 100.0, 42));
        let samples = (0..10_000)
            .map(|_| tarpit.compute_delay().as_millis() as f64)
            .collect::<Vec<_>>();

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let std_dev = var.sqrt();

        // Truncation to whole ms shifts the mean down by ~0.5ms.
        assert!((590.0..610.0).contains(&mean), "mean was {mean}");
        assert!((90.0..110.0).contains(&std_dev), "std dev was {std_dev}");
    }

    #[test]
    fn zero_spread_gives_constant_delay() {
        let tarpit = tarpit_with(NormalJitter::seeded(500.0, 0.0, 1));
        for _ in 0..10 {
            assert_eq!(tarpit.compute_delay(), Duration::from_millis(600));
        }
    }

    #[tokio::test]
    async fn apply_sleeps_for_the_computed_delay() {
        let sleeper = TrackingSleeper::new();
        let tarpit = Tarpit::new(
            100.0,
            Arc::new(FixedJitter(500.0)),
            Arc::new(sleeper.clone()),
        );

        let applied = tarpit.apply().await;

        assert_eq!(applied, Duration::from_millis(600));
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(600)]);
    }

    #[tokio::test]
    async fn tokio_sleeper_actually_sleeps() {
        let start = std::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn disabled_tarpit_returns_immediately() {
        assert_eq!(Tarpit::disabled().apply().await, Duration::ZERO);
    }
}
