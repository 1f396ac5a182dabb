//! Resilient cache for cryptocurrency exchange rates.
//!
//! [`ResilientCache`] fronts a rate-limited provider ([`RateSource`]) and
//! always answers with the best data it has plus a [`CacheStatus`] label:
//! concurrent refreshes are coalesced into one upstream call, and provider
//! failures fall back to the last good [`Snapshot`].

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod freshness;
pub mod metrics;
pub mod models;
pub mod single_flight;

pub use api::{CoinGeckoClient, RateSource};
pub use cache::{CacheState, Health, HealthStatus, ResilientCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ClientConfig};
pub use error::{CacheError, ConfigError, ConversionError, FetchError, FetchErrorKind};
pub use freshness::{Freshness, FreshnessPolicy};
pub use metrics::{EventCategory, MetricsRecorder, NoopMetrics, PrometheusMetrics};
pub use models::{CacheLookup, CacheStatus, CurrencyKind, RateRecord, RatesReport, Snapshot};
