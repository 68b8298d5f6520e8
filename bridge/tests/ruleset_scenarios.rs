//! End-to-end RuleSet compilation and distribution against the in-memory
//! cluster.

mod common;

use std::sync::Arc;

use bridge::cluster::{InMemoryCluster, ObjectKey};
use bridge::reconciler::{
    Controller, ControllerConfig, CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_READY, REASON_COMPILATION_FAILED,
    REASON_INVALID_RULE_SET, REASON_RULES_COMPILED, REASON_SERVING_LAST_KNOWN_GOOD,
    REASON_SOURCE_INVALID, REASON_SOURCE_UNAVAILABLE,
};
use bridge::telemetry::SubscriptionTracker;
use bridge::{DistributionServer, PollOutcome, RuleSetCache};
use common::{config_map, engine, rule_set, wait_for, Harness, NAMESPACE};
use rule_engine::crd::ConditionStatus;

const RULE1_RULE2_FINGERPRINT: &str =
    "d5d28c16ab3b6141e48f2db3909235a6df6a96732ec236e05e364ca5580b1148";

fn base_cluster() -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.apply_config_map(config_map("base", "rule1\n"));
    cluster.apply_config_map(config_map("custom", "rule2\n"));
    cluster.apply_rule_set(rule_set("default-rules", &["base", "custom"]));
    cluster
}

#[tokio::test]
async fn sources_compile_into_ordered_body() {
    let harness = Harness::start(base_cluster());

    let ready = harness
        .wait_rule_set_reason("default-rules", CONDITION_READY, REASON_RULES_COMPILED)
        .await;
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.observed_generation, Some(1));
    let degraded = harness
        .rule_set_condition("default-rules", CONDITION_DEGRADED)
        .await
        .unwrap();
    assert_eq!(degraded.status, ConditionStatus::False);
    let progressing = harness
        .rule_set_condition("default-rules", CONDITION_PROGRESSING)
        .await
        .unwrap();
    assert_eq!(progressing.status, ConditionStatus::False);

    match harness
        .distribution
        .poll(&Harness::key("default-rules"), "", "gw-1")
    {
        PollOutcome::Modified(record) => {
            assert_eq!(record.ruleset().body(), "rule1\nrule2\n");
            assert_eq!(record.fingerprint(), RULE1_RULE2_FINGERPRINT);
        }
        other => panic!("expected Modified, got {other:?}"),
    }

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn unreadable_source_keeps_serving_last_good() {
    let harness = Harness::start(base_cluster());
    let key = Harness::key("default-rules");
    harness
        .wait_rule_set_reason("default-rules", CONDITION_READY, REASON_RULES_COMPILED)
        .await;

    harness
        .cluster
        .delete(&ObjectKey::config_map(NAMESPACE, "custom"));

    let degraded = harness
        .wait_rule_set_reason("default-rules", CONDITION_DEGRADED, REASON_SOURCE_UNAVAILABLE)
        .await;
    assert_eq!(degraded.status, ConditionStatus::True);
    assert!(degraded.message.contains("custom"));

    let ready = harness
        .rule_set_condition("default-rules", CONDITION_READY)
        .await
        .unwrap();
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.reason, REASON_SERVING_LAST_KNOWN_GOOD);

    assert_eq!(
        harness.distribution.poll(&key, RULE1_RULE2_FINGERPRINT, "gw-1"),
        PollOutcome::NotModified {
            fingerprint: RULE1_RULE2_FINGERPRINT.to_string(),
            generation: 1,
        }
    );

    // Restoring the source recovers with the new content.
    harness
        .cluster
        .apply_config_map(config_map("custom", "rule3\n"));
    harness
        .wait_rule_set_reason("default-rules", CONDITION_READY, REASON_RULES_COMPILED)
        .await;
    match harness.distribution.poll(&key, RULE1_RULE2_FINGERPRINT, "gw-1") {
        PollOutcome::Modified(record) => assert_eq!(record.ruleset().body(), "rule1\nrule3\n"),
        other => panic!("expected Modified, got {other:?}"),
    }

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn config_map_update_triggers_recompile() {
    let harness = Harness::start(base_cluster());
    let key = Harness::key("default-rules");
    harness
        .wait_rule_set_reason("default-rules", CONDITION_READY, REASON_RULES_COMPILED)
        .await;

    harness
        .cluster
        .apply_config_map(config_map("base", "SecRuleEngine On\n"));

    let (h, k) = (&harness, &key);
    let record = wait_for(|| async move {
        match h.distribution.poll(k, RULE1_RULE2_FINGERPRINT, "gw-1") {
            PollOutcome::Modified(record) => Some(record),
            _ => None,
        }
    })
    .await
    .expect("recompiled ruleset was never published");
    assert_eq!(record.ruleset().body(), "SecRuleEngine On\nrule2\n");
    assert!(record.generation() > 1);

    let history = harness.distribution.history(&key, 10);
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].fingerprint(), RULE1_RULE2_FINGERPRINT);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn source_order_changes_fingerprint() {
    let cluster = base_cluster();
    cluster.apply_rule_set(rule_set("reversed", &["custom", "base"]));
    let harness = Harness::start(cluster);

    harness
        .wait_rule_set_reason("default-rules", CONDITION_READY, REASON_RULES_COMPILED)
        .await;
    harness
        .wait_rule_set_reason("reversed", CONDITION_READY, REASON_RULES_COMPILED)
        .await;

    let forward = harness
        .cache
        .get(&Harness::key("default-rules"))
        .unwrap()
        .current_fingerprint()
        .unwrap();
    let reversed = harness
        .cache
        .get(&Harness::key("reversed"))
        .unwrap()
        .read_current()
        .unwrap();
    assert_ne!(forward, reversed.fingerprint());
    assert_eq!(reversed.ruleset().body(), "rule2\nrule1\n");

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_rule_ids_fail_compilation() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.apply_config_map(config_map(
        "base",
        "SecRule ARGS \"@rx attack\" \"id:1001,phase:2,deny\"\n",
    ));
    cluster.apply_config_map(config_map(
        "custom",
        "SecAction \"id:1001,phase:1,pass,nolog\"\n",
    ));
    cluster.apply_rule_set(rule_set("default-rules", &["base", "custom"]));
    let harness = Harness::start(cluster);

    let ready = harness
        .wait_rule_set_reason("default-rules", CONDITION_READY, REASON_COMPILATION_FAILED)
        .await;
    assert_eq!(ready.status, ConditionStatus::False);
    assert!(ready.message.contains("1001"));
    assert_eq!(
        harness
            .distribution
            .poll(&Harness::key("default-rules"), "", "gw-1"),
        PollOutcome::Unavailable
    );

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn syntactically_broken_source_is_reported() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.apply_config_map(config_map("base", "SecRule ARGS \"@rx attack\n"));
    cluster.apply_rule_set(rule_set("default-rules", &["base"]));
    let harness = Harness::start(cluster);

    let degraded = harness
        .wait_rule_set_reason("default-rules", CONDITION_DEGRADED, REASON_SOURCE_INVALID)
        .await;
    assert_eq!(degraded.status, ConditionStatus::True);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn empty_rule_set_is_invalid() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.apply_rule_set(rule_set("empty", &[]));
    let harness = Harness::start(cluster);

    let ready = harness
        .wait_rule_set_reason("empty", CONDITION_READY, REASON_INVALID_RULE_SET)
        .await;
    assert_eq!(ready.status, ConditionStatus::False);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn deleting_rule_set_drops_its_versions() {
    let harness = Harness::start(base_cluster());
    let key = Harness::key("default-rules");
    harness
        .wait_rule_set_reason("default-rules", CONDITION_READY, REASON_RULES_COMPILED)
        .await;

    harness
        .cluster
        .delete(&ObjectKey::rule_set(NAMESPACE, "default-rules"));

    let (h, k) = (&harness, &key);
    wait_for(|| async move { h.cache.get(k).is_none().then_some(()) })
        .await
        .expect("version store was not dropped");
    assert_eq!(
        harness.distribution.poll(&key, RULE1_RULE2_FINGERPRINT, "gw-1"),
        PollOutcome::Unavailable
    );

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn persistent_outage_stops_the_controller() {
    let cluster = base_cluster();
    let harness = Harness::start(Arc::clone(&cluster));
    harness
        .wait_rule_set_reason("default-rules", CONDITION_READY, REASON_RULES_COMPILED)
        .await;

    cluster.set_available(false);
    // One change starts the failures; every failed reconcile is requeued,
    // so the budget runs out without further events.
    cluster.apply_config_map(config_map("base", "rule9\n"));
    let h = &harness;
    let finished = wait_for(|| async move { h.is_finished().then_some(()) }).await;
    assert!(finished.is_some(), "controller kept running through the outage");
    assert!(matches!(
        harness.stop().await,
        Err(bridge::ReconcileError::ClusterUnreachable { .. })
    ));
}

#[tokio::test]
async fn resync_cleans_up_deletes_missed_by_the_watch() {
    let cluster = base_cluster();
    cluster.apply_engine(engine("gateway", "default-rules", None));
    let cache = Arc::new(RuleSetCache::default());
    let controller = Controller::new(cluster.clone(), Arc::clone(&cache), ControllerConfig::default());
    let ctx = controller.context();
    let distribution = DistributionServer::new(Arc::clone(&cache), Arc::new(SubscriptionTracker::new()));

    let rule_set_key = ObjectKey::rule_set(NAMESPACE, "default-rules");
    let engine_key = ObjectKey::engine(NAMESPACE, "gateway");
    ctx.reconcile(&rule_set_key).await.unwrap();
    ctx.reconcile(&engine_key).await.unwrap();
    let name = rule_set_key.namespaced_name();
    assert!(cache.get(&name).is_some());
    assert_eq!(ctx.bindings.len(), 1);

    // Nothing is watching, so both Deleted events are lost.
    assert!(cluster.delete(&rule_set_key));
    assert!(cluster.delete(&engine_key));

    assert_eq!(ctx.enqueue_all().await.unwrap(), 2);
    while !ctx.queue.is_empty() {
        let Some(key) = ctx.queue.next().await else {
            break;
        };
        ctx.reconcile(&key).await.unwrap();
        ctx.queue.done(&key);
    }

    assert!(cache.get(&name).is_none());
    assert!(ctx.bindings.is_empty());
    assert_eq!(
        distribution.poll(&name, RULE1_RULE2_FINGERPRINT, "gw-1"),
        PollOutcome::Unavailable
    );
}
