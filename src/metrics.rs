//! Observability counters.
//!
//! The cache reports one request event per `get` and one upstream event per
//! provider call. Recorders are fire-and-forget and must not block.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

use crate::error::FetchErrorKind;

/// Latency buckets (seconds), 1ms to 10s.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// `get` served a fresh snapshot without a refresh.
    Hit,
    /// `get` refreshed and served new data.
    Refreshed,
    /// `get` fell back to a stale or expired snapshot.
    StaleServed,
    /// `get` had nothing to serve.
    HardError,
    UpstreamOk,
    UpstreamRateLimited,
    UpstreamNetworkError,
    UpstreamMalformed,
}

impl EventCategory {
    pub const ALL: [EventCategory; 8] = [
        Self::Hit,
        Self::Refreshed,
        Self::StaleServed,
        Self::HardError,
        Self::UpstreamOk,
        Self::UpstreamRateLimited,
        Self::UpstreamNetworkError,
        Self::UpstreamMalformed,
    ];

    pub fn upstream_failure(kind: FetchErrorKind) -> Self {
        match kind {
            FetchErrorKind::RateLimited => Self::UpstreamRateLimited,
            FetchErrorKind::Network => Self::UpstreamNetworkError,
            FetchErrorKind::MalformedResponse => Self::UpstreamMalformed,
        }
    }

    pub fn is_request_event(&self) -> bool {
        matches!(
            self,
            Self::Hit | Self::Refreshed | Self::StaleServed | Self::HardError
        )
    }

    /// Label value used in exported metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Refreshed => "refreshed",
            Self::StaleServed => "stale_served",
            Self::HardError => "hard_error",
            Self::UpstreamOk => "upstream_ok",
            Self::UpstreamRateLimited => "upstream_rate_limited",
            Self::UpstreamNetworkError => "upstream_network_error",
            Self::UpstreamMalformed => "upstream_malformed",
        }
    }
}

pub trait MetricsRecorder: Send + Sync {
    fn record_event(&self, category: EventCategory, duration_ms: u64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_event(&self, _category: EventCategory, _duration_ms: u64) {}
}

/// Prometheus-backed recorder.
///
/// Owns its registry rather than using the process default, so several
/// caches (and tests) can each have their own.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    /// Event counter - labels: category
    events_total: CounterVec,
    /// Event duration histogram - labels: category
    event_duration_seconds: HistogramVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("crypto_rates".to_string()), None)?;

        let events_total = CounterVec::new(
            Opts::new("events_total", "Cache requests and upstream calls by outcome"),
            &["category"],
        )?;
        let event_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "event_duration_seconds",
                "Duration of cache requests and upstream calls in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["category"],
        )?;

        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(event_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            events_total,
            event_duration_seconds,
        })
    }

    pub fn count(&self, category: EventCategory) -> u64 {
        self.events_total
            .with_label_values(&[category.as_str()])
            .get() as u64
    }

    /// Sum of all request events (one per `get`).
    pub fn request_count(&self) -> u64 {
        EventCategory::ALL
            .iter()
            .filter(|c| c.is_request_event())
            .map(|c| self.count(*c))
            .sum()
    }

    /// Total observed duration for a category, in seconds.
    pub fn duration_sum(&self, category: EventCategory) -> f64 {
        self.event_duration_seconds
            .with_label_values(&[category.as_str()])
            .get_sample_sum()
    }

    /// Text exposition format, as served on a `/metrics` endpoint.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsRecorder for PrometheusMetrics {
    fn record_event(&self, category: EventCategory, duration_ms: u64) {
        let label = category.as_str();
        self.events_total.with_label_values(&[label]).inc();
        self.event_duration_seconds
            .with_label_values(&[label])
            .observe(duration_ms as f64 / 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_metrics_tracks_counts_and_latency() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_event(EventCategory::Hit, 1);
        metrics.record_event(EventCategory::Hit, 3);
        metrics.record_event(EventCategory::UpstreamOk, 120);
        metrics.record_event(EventCategory::StaleServed, 2000);

        assert_eq!(metrics.count(EventCategory::Hit), 2);
        assert_eq!(metrics.count(EventCategory::HardError), 0);
        assert_eq!(metrics.request_count(), 3);
        assert!((metrics.duration_sum(EventCategory::Hit) - 0.004).abs() < 1e-9);
    }

    #[test]
    fn test_encode_exposes_category_labels() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_event(EventCategory::UpstreamRateLimited, 15);

        let text = metrics.encode().unwrap();
        assert!(text.contains("crypto_rates_events_total{category=\"upstream_rate_limited\"} 1"));
        assert!(text.contains("crypto_rates_event_duration_seconds_bucket"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = PrometheusMetrics::new().unwrap();
        let second = PrometheusMetrics::new().unwrap();
        first.record_event(EventCategory::Refreshed, 5);
        assert_eq!(first.count(EventCategory::Refreshed), 1);
        assert_eq!(second.count(EventCategory::Refreshed), 0);
    }

    #[test]
    fn test_upstream_failure_mapping() {
        assert_eq!(
            EventCategory::upstream_failure(FetchErrorKind::RateLimited),
            EventCategory::UpstreamRateLimited
        );
        assert!(!EventCategory::UpstreamMalformed.is_request_event());
    }
}
