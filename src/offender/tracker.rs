//! Repeat offender tracking and temporary bans.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::OffenderConfig;
use crate::ratelimit::ClientKey;

#[derive(Debug, Clone, Default)]
struct OffenderRecord {
    /// Violations since the last ban or decay
    violations: u32,
    banned_until: Option<Instant>,
    last_violation: Option<Instant>,
}

impl OffenderRecord {
    fn ban_active(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }

    fn ban_expired(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now >= until)
    }
}

/// Where a client stands after a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffenderStatus {
    Clean { violations: u32 },
    Banned { remaining: Duration },
}

/// Counts limiter rejections per client and bans clients that reach the
/// threshold.
///
/// Bans end on their own. Expired bans are evicted when the key is next
/// looked at, and by [`purge_expired`](Self::purge_expired).
#[derive(Debug)]
pub struct OffenderTracker {
    records: DashMap<String, OffenderRecord>,
    threshold: u32,
    ban_duration: Duration,
    decay: Option<Duration>,
}

impl OffenderTracker {
    pub fn new(config: &OffenderConfig) -> Self {
        Self {
            records: DashMap::new(),
            threshold: config.violation_threshold.max(1),
            ban_duration: Duration::from_millis(config.ban_duration_ms),
            decay: config.violation_decay_ms.map(Duration::from_millis),
        }
    }

    /// Register one rejection for `key`.
    ///
    /// Reaching the threshold bans the key and resets its violation count.
    /// Violations against a key that is already banned do not extend the
    /// ban.
    pub fn record_violation(&self, key: &ClientKey) -> OffenderStatus {
        let now = Instant::now();
        let mut record = self.records.entry(key.as_str().to_string()).or_default();

        if let Some(until) = record.banned_until {
            if now < until {
                return OffenderStatus::Banned {
                    remaining: until - now,
                };
            }
            *record = OffenderRecord::default();
        }

        if let (Some(decay), Some(last)) = (self.decay, record.last_violation) {
            if now.saturating_duration_since(last) >= decay {
                debug!(key = %key, forgotten = record.violations, "Violations decayed");
                record.violations = 0;
            }
        }

        record.violations += 1;
        record.last_violation = Some(now);

        if record.violations >= self.threshold {
            record.violations = 0;
            record.banned_until = Some(now + self.ban_duration);
            warn!(
                key = %key,
                threshold = self.threshold,
                ban_ms = self.ban_duration.as_millis() as u64,
                "Client banned after repeated rate limit violations"
            );
            return OffenderStatus::Banned {
                remaining: self.ban_duration,
            };
        }

        debug!(key = %key, violations = record.violations, "Recorded violation");
        OffenderStatus::Clean {
            violations: record.violations,
        }
    }

    /// Whether `key` is currently banned.
    pub fn is_banned(&self, key: &ClientKey) -> bool {
        let now = Instant::now();
        let expired = match self.records.get(key.as_str()) {
            Some(record) if record.ban_active(now) => return true,
            Some(record) => record.ban_expired(now),
            None => false,
        };

        if expired
            && self
                .records
                .remove_if(key.as_str(), |_, record| record.ban_expired(now))
                .is_some()
        {
            info!(key = %key, "Ban expired");
        }
        false
    }

    /// Violations counted toward the next ban.
    pub fn violations(&self, key: &ClientKey) -> u32 {
        let now = Instant::now();
        self.records
            .get(key.as_str())
            .filter(|record| !record.ban_expired(now))
            .map(|record| record.violations)
            .unwrap_or(0)
    }

    /// Number of keys under an active ban.
    pub fn banned_count(&self) -> usize {
        let now = Instant::now();
        self.records.iter().filter(|r| r.ban_active(now)).count()
    }

    /// Drop expired bans and decayed violation records.
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let decay = self.decay;
        let before = self.records.len();

        self.records.retain(|_, record| {
            if record.banned_until.is_some() {
                return record.ban_active(now);
            }
            match (decay, record.last_violation) {
                (Some(decay), Some(last)) => now.saturating_duration_since(last) < decay,
                _ => record.violations > 0,
            }
        });

        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, "Purged offender records");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ClientIdentifier;
    use axum::http::HeaderMap;

    fn key(ip: &str) -> ClientKey {
        ClientIdentifier::default().identify(&HeaderMap::new(), Some(ip.parse().unwrap()))
    }

    fn new_tracker(threshold: u32, ban_ms: u64, decay_ms: Option<u64>) -> OffenderTracker {
        OffenderTracker::new(&OffenderConfig {
            violation_threshold: threshold,
            ban_duration_ms: ban_ms,
            violation_decay_ms: decay_ms,
        })
    }

    #[test]
    fn test_threshold_violations_ban() {
        let tracker = new_tracker(5, 60_000, None);
        let client = key("192.0.2.1");

        for i in 1..5 {
            assert_eq!(
                tracker.record_violation(&client),
                OffenderStatus::Clean { violations: i }
            );
            assert!(!tracker.is_banned(&client));
        }

        assert!(matches!(
            tracker.record_violation(&client),
            OffenderStatus::Banned { .. }
        ));
        assert!(tracker.is_banned(&client));
        assert_eq!(tracker.violations(&client), 0);
        assert_eq!(tracker.banned_count(), 1);
    }

    #[test]
    fn test_keys_are_tracked_separately() {
        let tracker = new_tracker(2, 60_000, None);
        let a = key("192.0.2.1");
        let b = key("192.0.2.2");

        tracker.record_violation(&a);
        tracker.record_violation(&b);
        tracker.record_violation(&a);

        assert!(tracker.is_banned(&a));
        assert!(!tracker.is_banned(&b));
        assert_eq!(tracker.violations(&b), 1);
    }

    #[test]
    fn test_violations_while_banned_do_not_extend() {
        let tracker = new_tracker(1, 60_000, None);
        let client = key("192.0.2.1");

        tracker.record_violation(&client);
        match tracker.record_violation(&client) {
            OffenderStatus::Banned { remaining } => assert!(remaining <= Duration::from_secs(60)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tracker.violations(&client), 0);
    }

    #[test]
    fn test_ban_expires_and_resets() {
        let tracker = new_tracker(2, 50, None);
        let client = key("192.0.2.1");

        tracker.record_violation(&client);
        tracker.record_violation(&client);
        assert!(tracker.is_banned(&client));

        std::thread::sleep(Duration::from_millis(80));

        assert!(!tracker.is_banned(&client));
        assert_eq!(tracker.violations(&client), 0);
        assert_eq!(tracker.banned_count(), 0);

        // Counting starts from scratch
        assert_eq!(
            tracker.record_violation(&client),
            OffenderStatus::Clean { violations: 1 }
        );
    }

    #[test]
    fn test_no_decay_by_default() {
        let tracker = new_tracker(3, 60_000, None);
        let client = key("192.0.2.1");

        tracker.record_violation(&client);
        std::thread::sleep(Duration::from_millis(30));
        tracker.record_violation(&client);
        assert_eq!(tracker.violations(&client), 2);
    }

    #[test]
    fn test_decay_forgets_old_violations() {
        let tracker = new_tracker(3, 60_000, Some(20));
        let client = key("192.0.2.1");

        tracker.record_violation(&client);
        tracker.record_violation(&client);
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(
            tracker.record_violation(&client),
            OffenderStatus::Clean { violations: 1 }
        );
    }

    #[test]
    fn test_purge_expired() {
        let tracker = new_tracker(1, 30, Some(30));
        let banned = key("192.0.2.1");
        let noisy = key("192.0.2.2");

        tracker.record_violation(&banned);
        assert!(tracker.is_banned(&banned));

        std::thread::sleep(Duration::from_millis(50));
        let quiet = new_tracker(5, 30, Some(30));
        quiet.record_violation(&noisy);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(tracker.purge_expired(), 1);
        assert_eq!(quiet.purge_expired(), 1);
        assert_eq!(tracker.banned_count(), 0);
    }
}
