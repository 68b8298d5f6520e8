//! Shared harness: an in-memory cluster with a running controller.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bridge::cluster::{ClusterClient, InMemoryCluster};
use bridge::reconciler::{Controller, ControllerConfig};
use bridge::retry::RetryConfig;
use bridge::telemetry::SubscriptionTracker;
use bridge::{DistributionServer, NamespacedName, ReconcileError, RuleSetCache};
use rule_engine::crd::{
    find_condition, Condition, ConfigMap, DriverConfig, Engine, EngineSpec, FailurePolicy,
    IstioDriverConfig, IstioWasmConfig, LabelSelector, ObjectMeta, ObjectReference, RuleSet,
    RuleSetCacheServerConfig, WAF_API_VERSION,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const NAMESPACE: &str = "waf";
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub cache: Arc<RuleSetCache>,
    pub distribution: DistributionServer,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ReconcileError>>,
}

impl Harness {
    pub fn start(cluster: Arc<InMemoryCluster>) -> Self {
        let cache = Arc::new(RuleSetCache::default());
        let config = ControllerConfig {
            workers: 2,
            status_retry: RetryConfig::with_max_attempts(5)
                .with_initial_delay(Duration::from_millis(5)),
            error_requeue: Duration::from_millis(50),
            ..Default::default()
        };
        let controller = Controller::new(cluster.clone(), Arc::clone(&cache), config);
        let distribution =
            DistributionServer::new(Arc::clone(&cache), Arc::new(SubscriptionTracker::new()));

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(rx));
        Self {
            cluster,
            cache,
            distribution,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) -> Result<(), ReconcileError> {
        let _ = self.shutdown.send(true);
        self.task.await.expect("controller task panicked")
    }

    /// Whether the controller has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn rule_set_condition(&self, name: &str, type_: &str) -> Option<Condition> {
        let rule_set = self.cluster.get_rule_set(NAMESPACE, name).await.ok()?;
        find_condition(&rule_set.status.conditions, type_).cloned()
    }

    pub async fn engine_condition(&self, name: &str, type_: &str) -> Option<Condition> {
        let engine = self.cluster.get_engine(NAMESPACE, name).await.ok()?;
        find_condition(&engine.status.conditions, type_).cloned()
    }

    /// Wait until `type_` on the RuleSet has `reason`.
    pub async fn wait_rule_set_reason(&self, name: &str, type_: &str, reason: &str) -> Condition {
        wait_for(|| async move {
            self.rule_set_condition(name, type_)
                .await
                .filter(|c| c.reason == reason)
        })
        .await
        .unwrap_or_else(|| panic!("RuleSet {name} never reached {type_}={reason}"))
    }

    pub async fn wait_engine_reason(&self, name: &str, type_: &str, reason: &str) -> Condition {
        wait_for(|| async move {
            self.engine_condition(name, type_)
                .await
                .filter(|c| c.reason == reason)
        })
        .await
        .unwrap_or_else(|| panic!("Engine {name} never reached {type_}={reason}"))
    }

    pub fn key(name: &str) -> NamespacedName {
        NamespacedName::new(NAMESPACE, name)
    }
}

/// Poll `check` until it yields `Some`, or give up after the timeout.
pub async fn wait_for<T, F, Fut>(mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn config_map(name: &str, rules: &str) -> ConfigMap {
    ConfigMap::new(NAMESPACE, name).with_data("rules", rules)
}

pub fn rule_set(name: &str, sources: &[&str]) -> RuleSet {
    RuleSet::new(
        NAMESPACE,
        name,
        sources.iter().map(|s| ObjectReference::config_map(*s)).collect(),
    )
}

pub fn engine(name: &str, rule_set: &str, cache_server: Option<RuleSetCacheServerConfig>) -> Engine {
    Engine {
        api_version: WAF_API_VERSION.to_string(),
        kind: "Engine".to_string(),
        metadata: ObjectMeta::new(NAMESPACE, name),
        spec: EngineSpec {
            rule_set: ObjectReference::new(WAF_API_VERSION, "RuleSet", rule_set),
            driver: DriverConfig {
                istio: IstioDriverConfig::Wasm(IstioWasmConfig {
                    mode: Default::default(),
                    workload_selector: Some(LabelSelector::from_labels([(
                        "istio",
                        "ingressgateway",
                    )])),
                    image: "oci://ghcr.io/corazawaf/coraza-proxy-wasm:main".to_string(),
                    rule_set_cache_server: cache_server,
                }),
            },
            failure_policy: FailurePolicy::Fail,
        },
        status: Default::default(),
    }
}
