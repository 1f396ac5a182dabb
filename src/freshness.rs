//! Age classification for held snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// How usable a held snapshot is right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than the fresh window. Served without a refresh.
    Fresh,
    /// Inside the stale ceiling. A short opportunistic refresh is attempted.
    Stale,
    /// At or beyond the stale ceiling. A refresh is forced.
    Expired,
    /// Nothing has been fetched yet.
    Absent,
}

/// Pure classifier over two configured windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    fresh_window: Duration,
    stale_ceiling: Duration,
}

impl FreshnessPolicy {
    pub fn new(fresh_window: Duration, stale_ceiling: Duration) -> Self {
        Self {
            fresh_window,
            stale_ceiling,
        }
    }

    pub fn fresh_window(&self) -> Duration {
        self.fresh_window
    }

    pub fn stale_ceiling(&self) -> Duration {
        self.stale_ceiling
    }

    /// A `fetched_at` in the future (clock skew) counts as age zero.
    pub fn classify(&self, now: DateTime<Utc>, fetched_at: Option<DateTime<Utc>>) -> Freshness {
        let Some(fetched_at) = fetched_at else {
            return Freshness::Absent;
        };
        let age = (now - fetched_at).to_std().unwrap_or(Duration::ZERO);
        if age < self.fresh_window {
            Freshness::Fresh
        } else if age < self.stale_ceiling {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> FreshnessPolicy {
        FreshnessPolicy::new(Duration::from_secs(300), Duration::from_secs(3600))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_absent_without_snapshot() {
        assert_eq!(policy().classify(now(), None), Freshness::Absent);
    }

    #[test]
    fn test_fresh_window_boundary() {
        let p = policy();
        let just_inside = now() - chrono::Duration::seconds(300 - 1);
        let just_outside = now() - chrono::Duration::seconds(300 + 1);
        let exactly = now() - chrono::Duration::seconds(300);
        assert_eq!(p.classify(now(), Some(just_inside)), Freshness::Fresh);
        assert_eq!(p.classify(now(), Some(just_outside)), Freshness::Stale);
        assert_eq!(p.classify(now(), Some(exactly)), Freshness::Stale);
    }

    #[test]
    fn test_stale_ceiling_boundary() {
        let p = policy();
        let before = now() - chrono::Duration::seconds(3599);
        let at = now() - chrono::Duration::seconds(3600);
        assert_eq!(p.classify(now(), Some(before)), Freshness::Stale);
        assert_eq!(p.classify(now(), Some(at)), Freshness::Expired);
        assert_eq!(
            p.classify(now(), Some(now() - chrono::Duration::days(3))),
            Freshness::Expired
        );
    }

    #[test]
    fn test_future_timestamp_is_fresh() {
        let ahead = now() + chrono::Duration::seconds(30);
        assert_eq!(policy().classify(now(), Some(ahead)), Freshness::Fresh);
    }
}
