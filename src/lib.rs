//!
//! A rate-limiting reverse proxy built on [Hyper].
//!
//! Every inbound request is keyed by its method and client identity and
//! checked against a per-key leaky bucket. Admitted requests are forwarded
//! to a single downstream target; rejected requests are held in a tarpit for
//! a randomized delay and then answered with 429.
//!
//! [Hyper]: https://hyper.rs/

pub mod admission;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
pub mod forward;
pub mod headers;
pub mod proxy;
pub mod rate_limit;
pub mod server;
pub mod tarpit;

pub use admission::{Admission, AdmissionController};
pub use bucket::{Bucket, BucketConfig, BucketOverflow};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BucketLimitConfig, Config, LimitsConfig, PoolConfig, RuntimeConfig, TarpitConfig,
    TimeoutsConfig,
};
pub use error::ProxyError;
pub use forward::Dispatcher;
pub use proxy::{BoxBody, HttpClient, HttpsClient, Proxy, build_client, handle_request};
pub use rate_limit::{MethodLimits, RateLimitKey, RateLimiterRegistry};
pub use tarpit::{
    DelayDistribution, FixedJitter, InstantSleeper, NormalJitter, Sleeper, Tarpit, TokioSleeper,
    TrackingSleeper,
};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ProxyError>;
