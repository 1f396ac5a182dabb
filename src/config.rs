use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::freshness::FreshnessPolicy;

pub const DEFAULT_FRESH_WINDOW: Duration = Duration::from_secs(300); // 5 minutes
pub const DEFAULT_STALE_CEILING: Duration = Duration::from_secs(3600); // 1 hour
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FORCED_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Windows and timeouts used by the resilient cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub fresh_window: Duration,
    pub stale_ceiling: Duration,
    /// Bound on waiting for a refresh when stale data could be served instead.
    pub refresh_timeout: Duration,
    /// Bound on waiting for a refresh when data is expired or absent.
    pub forced_refresh_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_window: DEFAULT_FRESH_WINDOW,
            stale_ceiling: DEFAULT_STALE_CEILING,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            forced_refresh_timeout: DEFAULT_FORCED_REFRESH_TIMEOUT,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        // CACHE_DURATION is the older name of the fresh window.
        let fresh_window = match lookup("FRESH_WINDOW_SECS") {
            Some(raw) => secs("FRESH_WINDOW_SECS", &raw)?,
            None => match lookup("CACHE_DURATION") {
                Some(raw) => secs("CACHE_DURATION", &raw)?,
                None => defaults.fresh_window,
            },
        };
        let config = Self {
            fresh_window,
            stale_ceiling: optional(&lookup, "STALE_CEILING_SECS", secs)?
                .unwrap_or(defaults.stale_ceiling),
            refresh_timeout: optional(&lookup, "REFRESH_TIMEOUT_MS", millis)?
                .unwrap_or(defaults.refresh_timeout),
            forced_refresh_timeout: optional(&lookup, "FORCED_REFRESH_TIMEOUT_MS", millis)?
                .unwrap_or(defaults.forced_refresh_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fresh_window.is_zero()
            || self.refresh_timeout.is_zero()
            || self.forced_refresh_timeout.is_zero()
        {
            return Err(ConfigError::Inconsistent(
                "durations must be greater than zero".to_string(),
            ));
        }
        if self.fresh_window >= self.stale_ceiling {
            return Err(ConfigError::Inconsistent(format!(
                "fresh window ({:?}) must be shorter than stale ceiling ({:?})",
                self.fresh_window, self.stale_ceiling
            )));
        }
        if self.refresh_timeout > self.forced_refresh_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "refresh timeout ({:?}) exceeds forced refresh timeout ({:?})",
                self.refresh_timeout, self.forced_refresh_timeout
            )));
        }
        Ok(())
    }

    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy::new(self.fresh_window, self.stale_ceiling)
    }
}

/// Settings for the CoinGecko client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub api_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_API_TIMEOUT,
            api_key: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout = optional(&lookup, "API_TIMEOUT", secs)?.unwrap_or(defaults.timeout);
        if timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "API_TIMEOUT".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(Self {
            base_url: lookup("COINGECKO_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            timeout,
            api_key: lookup("API_KEY").filter(|key| !key.trim().is_empty()),
        })
    }
}

fn optional<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: fn(&str, &str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConfigError> {
    lookup(key).map(|raw| parse(key, &raw)).transpose()
}

fn number<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn secs(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    number::<u64>(key, raw).map(Duration::from_secs)
}

fn millis(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    number::<u64>(key, raw).map(Duration::from_millis)
}
