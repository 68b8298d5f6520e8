//! Per-engine poll bookkeeping.
//!
//! Purely observational: which fingerprint each engine was last served and
//! when it last polled. Nothing here influences what a poll returns, and the
//! table starts empty on every restart.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::RwLock;

use crate::cluster::NamespacedName;

/// Default idle time after which a subscription is forgotten.
pub const DEFAULT_SUBSCRIPTION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSubscription {
    pub client_id: String,
    pub rule_set: NamespacedName,
    /// Fingerprint the client holds after the last poll.
    pub last_fingerprint: String,
    pub last_poll: DateTime<Utc>,
    pub poll_count: u64,
}

#[derive(Default)]
pub struct SubscriptionTracker {
    entries: RwLock<HashMap<(String, NamespacedName), PollSubscription>>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, client_id: &str, rule_set: &NamespacedName, fingerprint: &str) {
        self.record_at(client_id, rule_set, fingerprint, Utc::now());
    }

    fn record_at(
        &self,
        client_id: &str,
        rule_set: &NamespacedName,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry((client_id.to_string(), rule_set.clone()))
            .or_insert_with(|| PollSubscription {
                client_id: client_id.to_string(),
                rule_set: rule_set.clone(),
                last_fingerprint: String::new(),
                last_poll: at,
                poll_count: 0,
            });
        entry.last_fingerprint = fingerprint.to_string();
        entry.last_poll = at;
        entry.poll_count += 1;
    }

    /// Subscriptions, optionally restricted to one namespace and/or RuleSet
    /// name, sorted by RuleSet then client.
    pub fn list(&self, namespace: Option<&str>, name: Option<&str>) -> Vec<PollSubscription> {
        let mut subscriptions: Vec<_> = self
            .entries
            .read()
            .values()
            .filter(|s| namespace.map_or(true, |ns| s.rule_set.namespace == ns))
            .filter(|s| name.map_or(true, |n| s.rule_set.name == n))
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| {
            a.rule_set
                .cmp(&b.rule_set)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        subscriptions
    }

    /// Forget clients that have not polled within `ttl`. Returns how many
    /// were removed.
    pub fn prune_idle(&self, ttl: Duration) -> usize {
        self.prune_idle_at(ttl, Utc::now())
    }

    fn prune_idle_at(&self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = now - ttl;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, s| s.last_poll >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("pruned {} idle poll subscriptions", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> NamespacedName {
        NamespacedName::new("waf", "default-rules")
    }

    #[test]
    fn record_tracks_last_fingerprint_and_count() {
        let tracker = SubscriptionTracker::new();
        tracker.record("gw-1", &key(), "");
        tracker.record("gw-1", &key(), "abc");
        tracker.record("gw-1", &key(), "abc");

        let subs = tracker.list(None, None);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].last_fingerprint, "abc");
        assert_eq!(subs[0].poll_count, 3);
    }

    #[test]
    fn list_filters_by_rule_set() {
        let tracker = SubscriptionTracker::new();
        tracker.record("gw-1", &key(), "abc");
        tracker.record("gw-1", &NamespacedName::new("waf", "strict"), "def");
        tracker.record("gw-2", &NamespacedName::new("edge", "default-rules"), "ghi");

        assert_eq!(tracker.list(Some("waf"), None).len(), 2);
        assert_eq!(tracker.list(None, Some("default-rules")).len(), 2);
        assert_eq!(tracker.list(Some("waf"), Some("strict"))[0].last_fingerprint, "def");
    }

    #[test]
    fn prune_removes_only_idle_clients() {
        let tracker = SubscriptionTracker::new();
        let now = Utc::now();
        tracker.record_at("stale", &key(), "abc", now - chrono::Duration::hours(2));
        tracker.record_at("fresh", &key(), "abc", now - chrono::Duration::minutes(5));

        assert_eq!(tracker.prune_idle_at(DEFAULT_SUBSCRIPTION_TTL, now), 1);
        let remaining = tracker.list(None, None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].client_id, "fresh");
    }
}
