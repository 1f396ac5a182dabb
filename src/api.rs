use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::FetchError;
use crate::models::{CurrencyKind, RateRecord, Snapshot};

/// Upstream provider of full rate tables.
///
/// One call is one request to the provider; retrying, caching and
/// coalescing happen in the cache.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self) -> Result<Snapshot, FetchError>;
}

#[derive(Deserialize)]
struct RatesResponse {
    rates: Option<HashMap<String, RawRate>>,
}

#[derive(Deserialize)]
struct RawRate {
    name: Option<String>,
    unit: Option<String>,
    value: Option<f64>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// CoinGecko `/exchange_rates` client. Values are quoted against BTC.
pub struct CoinGeckoClient {
    http: reqwest::Client,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
}

impl CoinGeckoClient {
    pub fn new(config: ClientConfig, clock: Arc<dyn Clock>) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            clock,
        })
    }

    fn url(&self) -> String {
        format!("{}/exchange_rates", self.config.base_url)
    }
}

#[async_trait]
impl RateSource for CoinGeckoClient {
    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        info!("Fetching exchange rates from {}", self.url());

        let mut request = self.http.get(self.url());
        if let Some(key) = &self.config.api_key {
            request = request.header("x-cg-demo-api-key", key);
        }
        let response = request.send().await?;

        match response.status() {
            status if status.is_success() => {
                let body = response.text().await?;
                let snapshot = parse_rates(&body, self.clock.as_ref())?;
                info!("Fetched {} exchange rates", snapshot.currency_count());
                Ok(snapshot)
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => Err(FetchError::RateLimited(
                format!("API request limit exceeded ({})", response.status()),
            )),
            status => Err(FetchError::Network(format!(
                "Error fetching exchange rates: {}",
                status
            ))),
        }
    }
}

/// Turns a provider body into a snapshot stamped with `clock.now()`.
///
/// Entries with an unknown type or an unusable value are skipped. An empty
/// table is still returned; rejecting it is the cache's decision.
pub fn parse_rates(body: &str, clock: &dyn Clock) -> Result<Snapshot, FetchError> {
    let parsed: RatesResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;
    let raw_rates = parsed.rates.ok_or_else(|| {
        FetchError::MalformedResponse("Invalid API response: missing 'rates' field".to_string())
    })?;

    let mut rates = Vec::with_capacity(raw_rates.len());
    for (code, raw) in raw_rates {
        let raw_kind = raw.kind.unwrap_or_default();
        let Some(kind) = CurrencyKind::parse(&raw_kind) else {
            warn!("Skipping {}: unknown currency type {:?}", code, raw_kind);
            continue;
        };
        let value = raw.value.unwrap_or(0.0);
        if !value.is_finite() || value < 0.0 {
            warn!("Skipping {}: invalid value {}", code, value);
            continue;
        }
        let record = RateRecord {
            name: raw.name.unwrap_or_else(|| code.clone()),
            kind,
            unit: raw.unit.unwrap_or_else(|| "N/A".to_string()),
            value,
        };
        rates.push((code, record));
    }

    Snapshot::new(rates, clock.now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_parse_rates() {
        let body = r#"{
            "rates": {
                "btc": {"name": "Bitcoin", "unit": "BTC", "value": 1.0, "type": "crypto"},
                "USD": {"name": "US Dollar", "unit": "$", "value": 110567.272, "type": "fiat"},
                "xau": {"name": "Gold", "unit": "XAU", "value": 28.5, "type": "Commodity"}
            }
        }"#;
        let clock = clock();
        let snapshot = parse_rates(body, &clock).unwrap();
        assert_eq!(snapshot.currency_count(), 3);
        assert_eq!(snapshot.fetched_at(), clock.now());
        assert_eq!(snapshot.get("usd").unwrap().kind, CurrencyKind::Fiat);
        assert_eq!(snapshot.get("xau").unwrap().kind, CurrencyKind::Commodity);
    }

    #[test]
    fn test_parse_rates_applies_defaults_and_skips_bad_entries() {
        let body = r#"{
            "rates": {
                "sats": {"type": "crypto"},
                "odd": {"name": "Odd", "value": 2.0, "type": "meme"},
                "neg": {"name": "Neg", "value": -3.0, "type": "fiat"}
            }
        }"#;
        let snapshot = parse_rates(body, &clock()).unwrap();
        assert_eq!(snapshot.currency_count(), 1);
        let sats = snapshot.get("sats").unwrap();
        assert_eq!(sats.name, "sats");
        assert_eq!(sats.unit, "N/A");
        assert_eq!(sats.value, 0.0);
    }

    #[test]
    fn test_parse_rates_missing_field() {
        let err = parse_rates(r#"{"invalid": "response"}"#, &clock()).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));

        let err = parse_rates("<html>oops</html>", &clock()).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }

    #[test]
    fn test_parse_rates_empty_table() {
        let snapshot = parse_rates(r#"{"rates": {}}"#, &clock()).unwrap();
        assert_eq!(snapshot.currency_count(), 0);
    }
}
