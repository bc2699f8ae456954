//! Freshness Cache (C6): read-through, time-bounded, archive-aware,
//! force-refresh-aware policy deciding whether a tracking request is
//! served from storage or dispatches a scrape.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// spec.md §4.6 `should_refresh`.
///
/// - Archived always wins: never refresh an archived parcel, `force` or not.
/// - Otherwise `force` always refreshes.
/// - Otherwise refresh once the snapshot is older than `refresh_timeout`.
pub fn should_refresh(archived: bool, age: Duration, force: bool, refresh_timeout: Duration) -> bool {
    if archived {
        return false;
    }
    if force {
        return true;
    }
    age >= refresh_timeout
}

/// Whether `created` is old enough that the carrier's tracking window has
/// lapsed (spec.md §3 / §4.6).
pub fn is_outdated(created: DateTime<Utc>, outdated_period_days: i64, now: DateTime<Utc>) -> bool {
    (now - created).num_days() > outdated_period_days
}

/// The decision a lookup resolves to before the HTTP/service layer acts on
/// it. Kept separate from `should_refresh` because the outdated-by-slug
/// rule short-circuits it regardless of freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    ServeCached,
    Scrape,
}

pub struct FreshnessPolicy {
    pub refresh_timeout: Duration,
}

impl FreshnessPolicy {
    pub fn new(refresh_timeout: Duration) -> Self {
        Self { refresh_timeout }
    }

    /// Decides for a (carrier, code) lookup: outdated parcels looked up by
    /// natural key are still eligible for a fresh scrape (a new parcel row
    /// would be created for the fresh attempt); only slug lookups get the
    /// unconditional outdated-serves-cache short-circuit.
    pub fn decide_by_natural_key(
        &self,
        archived: bool,
        last_retrieved: DateTime<Utc>,
        force: bool,
        now: DateTime<Utc>,
    ) -> CacheDecision {
        let age = (now - last_retrieved)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if should_refresh(archived, age, force, self.refresh_timeout) {
            CacheDecision::Scrape
        } else {
            CacheDecision::ServeCached
        }
    }

    /// Decides for a slug lookup: an outdated parcel always serves cache,
    /// regardless of `force` or archived state (spec.md §4.6 out-of-band
    /// rule), protecting users from wasted fetches on long-dead parcels.
    pub fn decide_by_slug(
        &self,
        archived: bool,
        created: DateTime<Utc>,
        last_retrieved: DateTime<Utc>,
        outdated_period_days: i64,
        force: bool,
        now: DateTime<Utc>,
    ) -> CacheDecision {
        if is_outdated(created, outdated_period_days, now) {
            return CacheDecision::ServeCached;
        }
        self.decide_by_natural_key(archived, last_retrieved, force, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn archived_wins_over_force_in_every_state() {
        for diff in [0u64, 10, 10_000] {
            assert!(!should_refresh(
                true,
                Duration::from_secs(diff),
                true,
                Duration::from_secs(600)
            ));
            assert!(!should_refresh(
                true,
                Duration::from_secs(diff),
                false,
                Duration::from_secs(600)
            ));
        }
    }

    #[test]
    fn force_always_refreshes_when_not_archived() {
        assert!(should_refresh(false, Duration::from_secs(0), true, Duration::from_secs(600)));
        assert!(should_refresh(false, Duration::from_secs(100_000), true, Duration::from_secs(600)));
    }

    #[test]
    fn refresh_timeout_boundary() {
        let timeout = Duration::from_secs(600);
        assert!(!should_refresh(false, Duration::from_secs(599), false, timeout));
        assert!(should_refresh(false, Duration::from_secs(600), false, timeout));
    }

    #[test]
    fn outdated_by_slug_serves_cache_unconditionally() {
        let policy = FreshnessPolicy::new(Duration::from_secs(600));
        let now = Utc::now();
        let created = now - ChronoDuration::days(200);
        let decision = policy.decide_by_slug(false, created, created, 180, true, now);
        assert_eq!(decision, CacheDecision::ServeCached);
    }

    #[test]
    fn fresh_parcel_by_slug_honors_force() {
        let policy = FreshnessPolicy::new(Duration::from_secs(600));
        let now = Utc::now();
        let created = now - ChronoDuration::days(1);
        let decision = policy.decide_by_slug(false, created, created, 180, true, now);
        assert_eq!(decision, CacheDecision::Scrape);
    }
}
