// Status write-back with optimistic concurrency.
//
// Each attempt re-reads the object, merges the new conditions into its
// current status and writes with the freshly read resourceVersion. Conflicts
// and outages are retried with backoff; a deleted object is not an error.

use log::debug;
use rule_engine::crd::{upsert_condition, Condition, ObjectReference};

use super::Context;
use crate::cluster::ClusterError;
use crate::retry::retry_with_backoff_if;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Merge `conditions` into the RuleSet's status. Returns whether anything
/// was written.
pub async fn update_rule_set_conditions(
    ctx: &Context,
    namespace: &str,
    name: &str,
    conditions: &[Condition],
) -> Result<bool, ClusterError> {
    let result = retry_with_backoff_if(
        &ctx.config.status_retry,
        "RuleSet status update",
        ClusterError::is_transient,
        || async move {
            let latest = ctx.cluster.get_rule_set(namespace, name).await?;
            let mut status = latest.status.clone();
            let mut changed = false;
            for condition in conditions {
                changed |= upsert_condition(&mut status.conditions, condition.clone());
            }
            if !changed {
                return Ok(false);
            }
            ctx.cluster
                .update_rule_set_status(namespace, name, &latest.metadata.resource_version, status)
                .await
                .map(|_| true)
        },
    )
    .await;

    ignore_not_found(result, namespace, name)
}

/// Merge `conditions` and replace `ownedResources` on the Engine's status.
pub async fn update_engine_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    conditions: &[Condition],
    owned_resources: &[ObjectReference],
) -> Result<bool, ClusterError> {
    let result = retry_with_backoff_if(
        &ctx.config.status_retry,
        "Engine status update",
        ClusterError::is_transient,
        || async move {
            let latest = ctx.cluster.get_engine(namespace, name).await?;
            let mut status = latest.status.clone();
            let mut changed = status.owned_resources != owned_resources;
            status.owned_resources = owned_resources.to_vec();
            for condition in conditions {
                changed |= upsert_condition(&mut status.conditions, condition.clone());
            }
            if !changed {
                return Ok(false);
            }
            ctx.cluster
                .update_engine_status(namespace, name, &latest.metadata.resource_version, status)
                .await
                .map(|_| true)
        },
    )
    .await;

    ignore_not_found(result, namespace, name)
}

fn ignore_not_found(
    result: Result<bool, ClusterError>,
    namespace: &str,
    name: &str,
) -> Result<bool, ClusterError> {
    match result {
        Err(ClusterError::NotFound(_)) => {
            debug!("{}/{} deleted before its status could be written", namespace, name);
            Ok(false)
        }
        other => other,
    }
}
