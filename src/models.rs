use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ConversionError, FetchError};

/// Label reported in `RatesReport::data_source`.
pub const DATA_SOURCE: &str = "CoinGecko API";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyKind {
    Crypto,
    Fiat,
    Commodity,
}

impl CurrencyKind {
    /// Parses the provider's `type` field, ignoring case.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "crypto" => Some(Self::Crypto),
            "fiat" => Some(Self::Fiat),
            "commodity" => Some(Self::Commodity),
            _ => None,
        }
    }
}

/// One currency in a rate table. `value` is relative to the base unit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RateRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CurrencyKind,
    pub unit: String,
    pub value: f64,
}

/// A complete rate table plus the time it was retrieved.
///
/// Snapshots are immutable once built; the cache replaces them wholesale and
/// shares them behind an `Arc`. Deserialisation goes through [`Snapshot::new`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "SnapshotParts")]
pub struct Snapshot {
    rates: HashMap<String, RateRecord>,
    fetched_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct SnapshotParts {
    rates: HashMap<String, RateRecord>,
    fetched_at: DateTime<Utc>,
}

impl TryFrom<SnapshotParts> for Snapshot {
    type Error = FetchError;

    fn try_from(parts: SnapshotParts) -> Result<Self, Self::Error> {
        Snapshot::new(parts.rates, parts.fetched_at)
    }
}

impl Snapshot {
    /// Builds a snapshot, lower-casing currency codes.
    ///
    /// Fails if a value is negative or not finite, or if two codes collide
    /// after normalisation.
    pub fn new(
        rates: impl IntoIterator<Item = (String, RateRecord)>,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, FetchError> {
        let mut normalized = HashMap::new();
        for (code, record) in rates {
            if !record.value.is_finite() || record.value < 0.0 {
                return Err(FetchError::MalformedResponse(format!(
                    "invalid value {} for {}",
                    record.value, code
                )));
            }
            let code = normalize_code(&code);
            if normalized.insert(code.clone(), record).is_some() {
                return Err(FetchError::MalformedResponse(format!(
                    "duplicate currency code {}",
                    code
                )));
            }
        }
        Ok(Self {
            rates: normalized,
            fetched_at,
        })
    }

    pub fn rates(&self) -> &HashMap<String, RateRecord> {
        &self.rates
    }

    pub fn get(&self, code: &str) -> Option<&RateRecord> {
        self.rates.get(&normalize_code(code))
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn currency_count(&self) -> usize {
        self.rates.len()
    }

    /// Rates ordered by value, highest first; ties broken by code.
    pub fn sorted_by_value(&self) -> Vec<(&str, &RateRecord)> {
        let mut sorted: Vec<_> = self
            .rates
            .iter()
            .map(|(code, record)| (code.as_str(), record))
            .collect();
        sorted.sort_by(|a, b| {
            b.1.value
                .total_cmp(&a.1.value)
                .then_with(|| a.0.cmp(b.0))
        });
        sorted
    }

    /// Converts `amount` of `from` into `to` through the base unit.
    pub fn convert(&self, from: &str, to: &str, amount: f64) -> Result<f64, ConversionError> {
        if amount < 0.0 {
            return Err(ConversionError::NegativeAmount(amount));
        }
        let from_rate = self
            .get(from)
            .ok_or_else(|| ConversionError::UnknownCurrency(from.to_string()))?;
        let to_rate = self
            .get(to)
            .ok_or_else(|| ConversionError::UnknownCurrency(to.to_string()))?;
        if from_rate.value == 0.0 {
            return Err(ConversionError::ZeroRate(normalize_code(from)));
        }
        Ok(amount * to_rate.value / from_rate.value)
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_lowercase()
}

/// Freshness label handed back with the data.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Served from cache without touching the provider.
    Cached,
    /// Refreshed from the provider during this call.
    Fresh,
    /// Past the fresh window and a refresh did not succeed in time.
    Stale,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached => write!(f, "cached"),
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Successful result of a cache lookup.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub snapshot: Arc<Snapshot>,
    pub status: CacheStatus,
}

/// Wire body for a rates response.
#[derive(Serialize, Debug, Clone)]
pub struct RatesReport {
    pub last_updated: DateTime<Utc>,
    pub rates: Vec<ReportEntry>,
    pub total_currencies: usize,
    pub data_source: &'static str,
    pub cache_status: CacheStatus,
}

#[derive(Serialize, Debug, Clone)]
pub struct ReportEntry {
    pub code: String,
    #[serde(flatten)]
    pub record: RateRecord,
}

impl From<&CacheLookup> for RatesReport {
    fn from(lookup: &CacheLookup) -> Self {
        let snapshot = &lookup.snapshot;
        Self {
            last_updated: snapshot.fetched_at(),
            rates: snapshot
                .sorted_by_value()
                .into_iter()
                .map(|(code, record)| ReportEntry {
                    code: code.to_string(),
                    record: record.clone(),
                })
                .collect(),
            total_currencies: snapshot.currency_count(),
            data_source: DATA_SOURCE,
            cache_status: lookup.status,
        }
    }
}
