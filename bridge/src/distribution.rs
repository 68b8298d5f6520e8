//! # Distribution Server
//!
//! Answers engine polls from whatever is current in each RuleSet's version
//! store. Purely reactive: a poll is a fingerprint comparison against the
//! current record, and nothing is pushed. Whether an engine fails open or
//! closed while the answer is `Unavailable` is the engine's decision.

use std::sync::Arc;

use log::debug;
use rule_engine::VersionRecord;
use uuid::Uuid;

use crate::cache::RuleSetCache;
use crate::cluster::NamespacedName;
use crate::telemetry::{PollSubscription, SubscriptionTracker};

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The client's fingerprint is stale; here is the full current record.
    Modified(Arc<VersionRecord>),
    /// The client already holds the current version.
    NotModified { fingerprint: String, generation: u64 },
    /// Nothing has been compiled for this RuleSet yet.
    Unavailable,
}

impl PollOutcome {
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::Modified(record) => Some(record.fingerprint()),
            Self::NotModified { fingerprint, .. } => Some(fingerprint),
            Self::Unavailable => None,
        }
    }
}

pub struct DistributionServer {
    cache: Arc<RuleSetCache>,
    subscriptions: Arc<SubscriptionTracker>,
    server_id: Uuid,
}

impl DistributionServer {
    pub fn new(cache: Arc<RuleSetCache>, subscriptions: Arc<SubscriptionTracker>) -> Self {
        Self {
            cache,
            subscriptions,
            server_id: Uuid::new_v4(),
        }
    }

    /// Identity of this server process; changes on restart.
    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    pub fn poll(&self, rule_set: &NamespacedName, last_fingerprint: &str, client_id: &str) -> PollOutcome {
        let outcome = match self.cache.get(rule_set).map(|store| store.read_current()) {
            Some(Ok(current)) if current.fingerprint() == last_fingerprint => PollOutcome::NotModified {
                fingerprint: current.fingerprint().to_string(),
                generation: current.generation(),
            },
            Some(Ok(current)) => PollOutcome::Modified(current),
            Some(Err(_)) | None => PollOutcome::Unavailable,
        };

        // Only polls that were served a version count as subscriptions.
        if let Some(fingerprint) = outcome.fingerprint() {
            self.subscriptions.record(client_id, rule_set, fingerprint);
        }
        debug!(
            "poll {} from {}: {}",
            rule_set,
            client_id,
            match &outcome {
                PollOutcome::Modified(_) => "modified",
                PollOutcome::NotModified { .. } => "not modified",
                PollOutcome::Unavailable => "unavailable",
            }
        );
        outcome
    }

    /// Recently published versions for a RuleSet, newest first.
    pub fn history(&self, rule_set: &NamespacedName, limit: usize) -> Vec<Arc<VersionRecord>> {
        self.cache
            .get(rule_set)
            .map(|store| store.history(limit))
            .unwrap_or_default()
    }

    pub fn subscriptions(&self, namespace: Option<&str>, name: Option<&str>) -> Vec<PollSubscription> {
        self.subscriptions.list(namespace, name)
    }
}
