//! On-demand RuleSet refresh.
//!
//! Triggered through the `RefreshRuleSet` RPC. Forces a recompilation of one
//! RuleSet without waiting for a watch event or the periodic resync.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;

use crate::cluster::{ClusterClient, ClusterError, NamespacedName, ObjectKey};
use crate::reconciler::WorkQueue;

/// Result of a refresh request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshStats {
    pub rule_set: NamespacedName,
    /// False when the key was already queued and the request coalesced.
    pub newly_queued: bool,
    pub requested_at: DateTime<Utc>,
}

pub struct RefreshService {
    cluster: Arc<dyn ClusterClient>,
    queue: Arc<WorkQueue>,
}

impl RefreshService {
    pub fn new(cluster: Arc<dyn ClusterClient>, queue: Arc<WorkQueue>) -> Self {
        Self { cluster, queue }
    }

    /// Queue `rule_set` for recompilation.
    ///
    /// Fails with `NotFound` when the RuleSet does not exist, so callers can
    /// tell a typo from a queued request.
    pub async fn refresh(&self, rule_set: &NamespacedName) -> Result<RefreshStats, ClusterError> {
        self.cluster
            .get_rule_set(&rule_set.namespace, &rule_set.name)
            .await?;

        let key = ObjectKey::rule_set(rule_set.namespace.clone(), rule_set.name.clone());
        let newly_queued = self.queue.add(key);

        info!("refresh requested for RuleSet {}", rule_set);
        Ok(RefreshStats {
            rule_set: rule_set.clone(),
            newly_queued,
            requested_at: Utc::now(),
        })
    }
}
