//! Configuration loading, validation, and runtime state.
//!
//! The proxy reads its YAML configuration exactly once at startup. Every
//! field is optional; missing values fall back to the defaults below. The
//! raw [`Config`] is validated into a [`RuntimeConfig`] holding parsed
//! addresses, URIs, bucket shapes, and durations.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bucket::BucketConfig;
use crate::rate_limit::MethodLimits;
use crate::{ProxyError, Result};

/// Default socket address the proxy binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default downstream target every admitted request is forwarded to.
pub const DEFAULT_DOWNSTREAM: &str = "http://localhost:8090";

/// Default maximum request body size buffered before forwarding: 10 MiB.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

/// Default burst and sustained rate for `GET` requests.
pub const DEFAULT_GET_CAPACITY: u64 = 50;
pub const DEFAULT_GET_DRAIN_AMOUNT: u64 = 8;

/// Default burst and sustained rate for every other method.
pub const DEFAULT_OTHER_CAPACITY: u64 = 10;
pub const DEFAULT_OTHER_DRAIN_AMOUNT: u64 = 1;

/// Default drain period for both method classes.
pub const DEFAULT_DRAIN_PERIOD: Duration = Duration::from_secs(1);

/// Default tarpit parameters, in milliseconds.
pub const DEFAULT_TARPIT_BASE_MS: u64 = 100;
pub const DEFAULT_TARPIT_JITTER_MEAN_MS: u64 = 500;
pub const DEFAULT_TARPIT_JITTER_STD_DEV_MS: u64 = 100;

/// Default timeout for establishing downstream TCP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for completing a downstream TLS handshake.
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(6);

/// Default total timeout covering the downstream round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle timeout for pooled connections before they are closed.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of idle connections kept to the downstream host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Default interval between sweeps that drop fully drained buckets.
pub const DEFAULT_BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Raw configuration as deserialized from the YAML file.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address the proxy listens on (default `"127.0.0.1:8080"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Base URL of the downstream target (default `"http://localhost:8090"`).
    #[serde(default)]
    pub downstream: Option<String>,
    /// Bucket shapes per method class.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Delay applied to throttled requests.
    #[serde(default)]
    pub tarpit: TarpitConfig,
    /// Downstream connect, TLS handshake, and overall request timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Downstream connection pool tuning.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Maximum inbound body size in bytes (default: 10 MiB).
    #[serde(default)]
    pub max_body_size: Option<u64>,
    /// Interval in milliseconds between drained-bucket sweeps
    /// (default: 60000). `0` disables the sweep.
    #[serde(default)]
    pub bucket_sweep_interval_ms: Option<u64>,
}

/// Bucket shapes for `GET` and for every other method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    #[serde(default = "default_get_limit")]
    pub get: BucketLimitConfig,
    #[serde(default = "default_other_limit")]
    pub other: BucketLimitConfig,
}

/// One bucket shape as written in the config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BucketLimitConfig {
    /// Burst size.
    pub capacity: u64,
    /// Units drained per period.
    pub drain_amount: u64,
    /// Drain period in milliseconds (default: 1000).
    #[serde(default = "default_drain_period_ms")]
    pub drain_period_ms: u64,
}

fn default_drain_period_ms() -> u64 {
    DEFAULT_DRAIN_PERIOD.as_millis() as u64
}

fn default_get_limit() -> BucketLimitConfig {
    BucketLimitConfig {
        capacity: DEFAULT_GET_CAPACITY,
        drain_amount: DEFAULT_GET_DRAIN_AMOUNT,
        drain_period_ms: default_drain_period_ms(),
    }
}

fn default_other_limit() -> BucketLimitConfig {
    BucketLimitConfig {
        capacity: DEFAULT_OTHER_CAPACITY,
        drain_amount: DEFAULT_OTHER_DRAIN_AMOUNT,
        drain_period_ms: default_drain_period_ms(),
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            get: default_get_limit(),
            other: default_other_limit(),
        }
    }
}

/// Tarpit delay: `|base_ms + Normal(jitter_mean_ms, jitter_std_dev_ms)|`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TarpitConfig {
    #[serde(default = "default_tarpit_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_tarpit_jitter_mean_ms")]
    pub jitter_mean_ms: u64,
    #[serde(default = "default_tarpit_jitter_std_dev_ms")]
    pub jitter_std_dev_ms: u64,
    /// Fixed seed for the jitter generator. Seeded from the OS when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_tarpit_base_ms() -> u64 {
    DEFAULT_TARPIT_BASE_MS
}

fn default_tarpit_jitter_mean_ms() -> u64 {
    DEFAULT_TARPIT_JITTER_MEAN_MS
}

fn default_tarpit_jitter_std_dev_ms() -> u64 {
    DEFAULT_TARPIT_JITTER_STD_DEV_MS
}

impl Default for TarpitConfig {
    fn default() -> Self {
        Self {
            base_ms: default_tarpit_base_ms(),
            jitter_mean_ms: default_tarpit_jitter_mean_ms(),
            jitter_std_dev_ms: default_tarpit_jitter_std_dev_ms(),
            seed: None,
        }
    }
}

/// Timeouts for downstream calls, in milliseconds. All must be non-zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_tls_handshake_ms")]
    pub tls_handshake_ms: u64,
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,
}

fn default_connect_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_tls_handshake_ms() -> u64 {
    DEFAULT_TLS_HANDSHAKE_TIMEOUT.as_millis() as u64
}

fn default_request_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            tls_handshake_ms: default_tls_handshake_ms(),
            request_ms: default_request_ms(),
        }
    }
}

/// Downstream connection pool settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

fn default_pool_idle_timeout_ms() -> u64 {
    DEFAULT_POOL_IDLE_TIMEOUT.as_millis() as u64
}

fn default_pool_max_idle_per_host() -> usize {
    DEFAULT_POOL_MAX_IDLE_PER_HOST
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_pool_idle_timeout_ms(),
            max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

/// Validated downstream timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub tls_handshake: Duration,
    pub request: Duration,
}

/// Validated pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared with everything that needs it.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Socket address the proxy binds to.
    pub listen: SocketAddr,
    /// Parsed downstream base URI (scheme + authority, optional base path).
    pub downstream: hyper::Uri,
    /// Bucket shapes per method class.
    pub limits: MethodLimits,
    /// Tarpit parameters, passed through as configured.
    pub tarpit: TarpitConfig,
    /// Downstream timeouts.
    pub timeouts: Timeouts,
    /// Downstream pool settings.
    pub pool: Pool,
    /// Maximum inbound body size in bytes. Larger bodies yield 413.
    pub max_body_size: u64,
    /// Interval between drained-bucket sweeps. `None` disables the sweep.
    pub bucket_sweep_interval: Option<Duration>,
}

/// Validates the downstream base URL.
fn validate_downstream(address: &str) -> Result<hyper::Uri> {
    if address.is_empty() {
        return Err(ProxyError::InvalidDownstream(
            "downstream address must not be empty".into(),
        ));
    }

    let uri = address
        .parse::<hyper::Uri>()
        .map_err(|e| ProxyError::InvalidDownstream(format!("{address}: {e}")))?;

    match uri.scheme_str() {
        Some(s) if s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https") => {}
        _ => {
            return Err(ProxyError::InvalidDownstream(format!(
                "downstream must use http or https: {address}"
            )));
        }
    }

    uri.authority().ok_or_else(|| {
        ProxyError::InvalidDownstream(format!("downstream URI has no authority: {address}"))
    })?;

    if uri.query().is_some() {
        return Err(ProxyError::InvalidDownstream(format!(
            "downstream URI must not carry a query string: {address}"
        )));
    }

    Ok(uri)
}

fn validate_bucket(class: &str, limit: &BucketLimitConfig) -> Result<BucketConfig> {
    if limit.capacity == 0 {
        return Err(ProxyError::Config(format!(
            "limits.{class}.capacity must be positive"
        )));
    }
    if limit.drain_amount == 0 {
        return Err(ProxyError::Config(format!(
            "limits.{class}.drain_amount must be positive"
        )));
    }
    if limit.drain_period_ms == 0 {
        return Err(ProxyError::Config(format!(
            "limits.{class}.drain_period_ms must be positive"
        )));
    }

    Ok(BucketConfig {
        capacity: limit.capacity,
        drain_amount: limit.drain_amount,
        drain_period: Duration::from_millis(limit.drain_period_ms),
    })
}

fn validate_timeout(name: &str, millis: u64) -> Result<Duration> {
    if millis == 0 {
        return Err(ProxyError::Config(format!(
            "timeouts.{name} must be positive"
        )));
    }
    Ok(Duration::from_millis(millis))
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`ProxyError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            ProxyError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`].
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            ProxyError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let downstream =
            validate_downstream(self.downstream.as_deref().unwrap_or(DEFAULT_DOWNSTREAM))?;

        let limits = MethodLimits {
            get: validate_bucket("get", &self.limits.get)?,
            other: validate_bucket("other", &self.limits.other)?,
        };

        let timeouts = Timeouts {
            connect: validate_timeout("connect_ms", self.timeouts.connect_ms)?,
            tls_handshake: validate_timeout("tls_handshake_ms", self.timeouts.tls_handshake_ms)?,
            request: validate_timeout("request_ms", self.timeouts.request_ms)?,
        };

        let pool = Pool {
            idle_timeout: Duration::from_millis(self.pool.idle_timeout_ms),
            max_idle_per_host: self.pool.max_idle_per_host,
        };

        let max_body_size = self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE);

        let bucket_sweep_interval = match self.bucket_sweep_interval_ms {
            None => Some(DEFAULT_BUCKET_SWEEP_INTERVAL),
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        };

        Ok(RuntimeConfig {
            listen,
            downstream,
            limits,
            tarpit: self.tarpit,
            timeouts,
            pool,
            max_body_size,
            bucket_sweep_interval,
        })
    }
}
