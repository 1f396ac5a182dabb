//! Resilient rate cache.
//!
//! Sits between callers and the rate provider. Fresh data is served straight
//! from memory; older data triggers a coalesced refresh bounded by a timeout,
//! and any failure degrades to the last good snapshot instead of an error.
//! Only a cold start with a failing provider surfaces [`CacheError`].

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::api::RateSource;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, FetchError};
use crate::freshness::{Freshness, FreshnessPolicy};
use crate::metrics::{EventCategory, MetricsRecorder, NoopMetrics};
use crate::models::{CacheLookup, CacheStatus, Snapshot};
use crate::single_flight::SingleFlight;

/// Holder of the current snapshot.
///
/// Readers clone the `Arc`; writers swap it whole. A candidate older than the
/// held snapshot is never accepted.
#[derive(Debug, Default)]
pub struct CacheState {
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Installs `candidate` unless a newer snapshot is already held.
    ///
    /// Returns whatever is held afterwards.
    pub fn publish(&self, candidate: Arc<Snapshot>) -> Arc<Snapshot> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(held) if held.fetched_at() > candidate.fetched_at() => {
                debug!(
                    "Discarding snapshot fetched at {}; holding newer one from {}",
                    candidate.fetched_at(),
                    held.fetched_at()
                );
                Arc::clone(held)
            }
            _ => {
                *guard = Some(Arc::clone(&candidate));
                candidate
            }
        }
    }
}

/// Overall state reported by [`ResilientCache::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Fresh or stale data is held.
    Healthy,
    /// Only expired data is held.
    Degraded,
    /// Nothing has ever been fetched.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct Health {
    pub status: HealthStatus,
    pub freshness: Freshness,
    pub age: Option<Duration>,
    pub currency_count: usize,
}

/// Everything a refresh task needs, cloned into the spawned future.
#[derive(Clone)]
struct Refresher {
    state: Arc<CacheState>,
    source: Arc<dyn RateSource>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRecorder>,
    policy: FreshnessPolicy,
}

impl Refresher {
    async fn run(self) -> Result<Arc<Snapshot>, FetchError> {
        // A flight that finished just before this one started may already
        // have published fresh data.
        if let Some(held) = self.state.current() {
            if self.policy.classify(self.clock.now(), Some(held.fetched_at())) == Freshness::Fresh
            {
                debug!("Snapshot refreshed concurrently, skipping upstream call");
                return Ok(held);
            }
        }

        let started = Instant::now();
        let result = self.source.fetch().await.and_then(|snapshot| {
            if snapshot.currency_count() == 0 {
                Err(FetchError::MalformedResponse(
                    "provider returned an empty rate table".to_string(),
                ))
            } else {
                Ok(snapshot)
            }
        });
        let elapsed = elapsed_ms(started);

        match result {
            Ok(snapshot) => {
                self.metrics.record_event(EventCategory::UpstreamOk, elapsed);
                info!(
                    "Refreshed {} exchange rates in {}ms",
                    snapshot.currency_count(),
                    elapsed
                );
                Ok(self.state.publish(Arc::new(snapshot)))
            }
            Err(err) => {
                self.metrics
                    .record_event(EventCategory::upstream_failure(err.kind()), elapsed);
                warn!("Exchange rate refresh failed: {}", err);
                Err(err)
            }
        }
    }
}

/// Serves rate snapshots with an honest freshness label.
///
/// Cheap to clone; clones share state, in-flight refreshes and collaborators.
#[derive(Clone)]
pub struct ResilientCache {
    refresher: Refresher,
    flights: Arc<SingleFlight<Arc<Snapshot>>>,
    config: CacheConfig,
}

impl ResilientCache {
    pub fn new(source: Arc<dyn RateSource>, config: CacheConfig) -> Self {
        Self {
            refresher: Refresher {
                state: Arc::new(CacheState::new()),
                source,
                clock: Arc::new(SystemClock),
                metrics: Arc::new(NoopMetrics),
                policy: config.freshness_policy(),
            },
            flights: Arc::new(SingleFlight::new()),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.refresher.clock = clock;
        self
    }

    /// Shares an externally owned state, e.g. one seeded in tests.
    pub fn with_state(mut self, state: Arc<CacheState>) -> Self {
        self.refresher.state = state;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.refresher.metrics = metrics;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns rates and how fresh they are.
    ///
    /// Fresh data never waits on I/O. Stale data waits at most
    /// `refresh_timeout` for a refresh; expired or absent data waits up to
    /// `forced_refresh_timeout`. A refresh that outlives its caller keeps
    /// running and updates the cache for later calls.
    pub async fn get(&self) -> Result<CacheLookup, CacheError> {
        let started = Instant::now();
        let result = match self.refresher.state.current() {
            None => self.cold_start().await,
            Some(held) => match self.classify(&held) {
                Freshness::Fresh => {
                    debug!("Returning cached exchange rates");
                    Ok(CacheLookup {
                        snapshot: held,
                        status: CacheStatus::Cached,
                    })
                }
                Freshness::Stale => Ok(self
                    .refresh_or_fallback(held, self.config.refresh_timeout)
                    .await),
                Freshness::Expired | Freshness::Absent => {
                    Ok(self
                        .refresh_or_fallback(held, self.config.forced_refresh_timeout)
                        .await)
                }
            },
        };

        let category = match &result {
            Ok(lookup) => match lookup.status {
                CacheStatus::Cached => EventCategory::Hit,
                CacheStatus::Fresh => EventCategory::Refreshed,
                CacheStatus::Stale => EventCategory::StaleServed,
            },
            Err(_) => EventCategory::HardError,
        };
        self.refresher
            .metrics
            .record_event(category, elapsed_ms(started));
        result
    }

    /// Current snapshot, without triggering a refresh.
    pub fn peek(&self) -> Option<Arc<Snapshot>> {
        self.refresher.state.current()
    }

    pub fn health(&self) -> Health {
        let held = self.peek();
        let freshness = self
            .refresher
            .policy
            .classify(self.refresher.clock.now(), held.as_ref().map(|s| s.fetched_at()));
        let status = match freshness {
            Freshness::Fresh | Freshness::Stale => HealthStatus::Healthy,
            Freshness::Expired => HealthStatus::Degraded,
            Freshness::Absent => HealthStatus::Unavailable,
        };
        Health {
            status,
            freshness,
            age: held.as_ref().map(|s| {
                (self.refresher.clock.now() - s.fetched_at())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            }),
            currency_count: held.map(|s| s.currency_count()).unwrap_or(0),
        }
    }

    fn classify(&self, snapshot: &Snapshot) -> Freshness {
        self.refresher
            .policy
            .classify(self.refresher.clock.now(), Some(snapshot.fetched_at()))
    }

    /// Label for a snapshot obtained through a refresh. The provider may
    /// hand back data that is already old, and a newer held snapshot wins
    /// over the fetched one, so the label follows the snapshot's own age.
    fn label(&self, snapshot: &Snapshot) -> CacheStatus {
        match self.classify(snapshot) {
            Freshness::Fresh => CacheStatus::Fresh,
            _ => CacheStatus::Stale,
        }
    }

    /// Waits up to `bound` for the shared refresh. `None` on timeout.
    async fn refresh(&self, bound: Duration) -> Option<Result<Arc<Snapshot>, FetchError>> {
        let (flight, _) = self
            .flights
            .join_or_start(self.refresher.clone().run());
        tokio::time::timeout(bound, flight).await.ok()
    }

    async fn refresh_or_fallback(&self, held: Arc<Snapshot>, bound: Duration) -> CacheLookup {
        match self.refresh(bound).await {
            Some(Ok(snapshot)) => CacheLookup {
                status: self.label(&snapshot),
                snapshot,
            },
            Some(Err(err)) => {
                warn!(
                    "Serving stale exchange rates from {} after refresh failure: {}",
                    held.fetched_at(),
                    err
                );
                CacheLookup {
                    snapshot: held,
                    status: CacheStatus::Stale,
                }
            }
            None => {
                warn!(
                    "Refresh did not finish within {:?}, serving exchange rates from {}",
                    bound,
                    held.fetched_at()
                );
                CacheLookup {
                    snapshot: held,
                    status: CacheStatus::Stale,
                }
            }
        }
    }

    async fn cold_start(&self) -> Result<CacheLookup, CacheError> {
        let last_error = match self.refresh(self.config.forced_refresh_timeout).await {
            Some(Ok(snapshot)) => {
                return Ok(CacheLookup {
                    status: self.label(&snapshot),
                    snapshot,
                })
            }
            Some(Err(err)) => Some(err),
            None => None,
        };

        // Another flight may have succeeded while this one was failing.
        if let Some(held) = self.refresher.state.current() {
            return Ok(CacheLookup {
                status: self.label(&held),
                snapshot: held,
            });
        }

        let err = CacheError::NoDataAvailable { last_error };
        error!("{} [{}]", err, err.code());
        Err(err)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CurrencyKind, RateRecord};
    use chrono::{DateTime, TimeZone, Utc};

    fn snapshot_at(fetched_at: DateTime<Utc>, btc: f64) -> Arc<Snapshot> {
        Arc::new(
            Snapshot::new(
                vec![(
                    "btc".to_string(),
                    RateRecord {
                        name: "Bitcoin".to_string(),
                        kind: CurrencyKind::Crypto,
                        unit: "BTC".to_string(),
                        value: btc,
                    },
                )],
                fetched_at,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_publish_accepts_newer() {
        let state = CacheState::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(state.current().is_none());

        state.publish(snapshot_at(t0, 1.0));
        let held = state.publish(snapshot_at(t0 + chrono::Duration::seconds(10), 2.0));
        assert_eq!(held.get("btc").unwrap().value, 2.0);
        assert_eq!(state.current().unwrap().fetched_at(), t0 + chrono::Duration::seconds(10));
    }

    #[test]
    fn test_publish_rejects_older() {
        let state = CacheState::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        state.publish(snapshot_at(t0, 2.0));

        let held = state.publish(snapshot_at(t0 - chrono::Duration::seconds(30), 1.0));
        assert_eq!(held.fetched_at(), t0);
        assert_eq!(state.current().unwrap().get("btc").unwrap().value, 2.0);
    }

    #[test]
    fn test_publish_keeps_maximum_regardless_of_order() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let orders: [[i64; 4]; 3] = [[1, 2, 3, 4], [4, 3, 2, 1], [2, 4, 1, 3]];
        for order in orders {
            let state = CacheState::new();
            for offset in order {
                state.publish(snapshot_at(t0 + chrono::Duration::seconds(offset), offset as f64));
            }
            assert_eq!(
                state.current().unwrap().fetched_at(),
                t0 + chrono::Duration::seconds(4)
            );
        }
    }
}
