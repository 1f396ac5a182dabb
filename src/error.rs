//! Error types for the rate cache.
//!
//! - [`FetchError`]: why a single upstream call failed. Absorbed by the cache
//!   whenever any snapshot is held.
//! - [`CacheError`]: the only error that crosses the cache boundary.

use thiserror::Error;

/// Failure of one upstream fetch.
///
/// Cloned to every waiter attached to a coalesced refresh, so it only carries
/// string context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The provider throttled the request (HTTP 429 / 403).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Transport failure, timeout, or a non-success status.
    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered with structurally invalid or empty data.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Coarse classification of a [`FetchError`], used for metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    RateLimited,
    Network,
    MalformedResponse,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::RateLimited(_) => FetchErrorKind::RateLimited,
            Self::Network(_) => FetchErrorKind::Network,
            Self::MalformedResponse(_) => FetchErrorKind::MalformedResponse,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for FetchError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Network(format!("refresh task aborted: {}", err))
    }
}

/// Error returned by [`ResilientCache::get`](crate::cache::ResilientCache::get).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// No snapshot has ever been obtained and the forced refresh failed too.
    #[error("No exchange rate data available{}", last_error_suffix(.last_error))]
    NoDataAvailable {
        /// The upstream failure behind the cold start, `None` when the refresh timed out.
        last_error: Option<FetchError>,
    },
}

impl CacheError {
    /// Stable tag for the boundary layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoDataAvailable { .. } => "EXTERNAL_API_DOWN",
        }
    }
}

fn last_error_suffix(last_error: &Option<FetchError>) -> String {
    match last_error {
        Some(err) => format!(": {}", err),
        None => ": refresh timed out".to_string(),
    }
}

/// Errors raised when converting an amount between two currencies.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("Currency {0} has a zero rate")]
    ZeroRate(String),

    #[error("Amount must not be negative: {0}")]
    NegativeAmount(f64),
}

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_kind() {
        assert_eq!(
            FetchError::RateLimited("429".into()).kind(),
            FetchErrorKind::RateLimited
        );
        assert_eq!(
            FetchError::MalformedResponse("empty".into()).kind(),
            FetchErrorKind::MalformedResponse
        );
    }

    #[test]
    fn test_no_data_available_message_and_code() {
        let err = CacheError::NoDataAvailable {
            last_error: Some(FetchError::Network("connection refused".into())),
        };
        assert_eq!(err.code(), "EXTERNAL_API_DOWN");
        assert_eq!(
            err.to_string(),
            "No exchange rate data available: Network error: connection refused"
        );

        let timed_out = CacheError::NoDataAvailable { last_error: None };
        assert!(timed_out.to_string().ends_with("refresh timed out"));
    }
}
