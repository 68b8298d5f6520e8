// In-process object store implementing ClusterClient.
//
// Keeps resourceVersion and generation bookkeeping the way the API server
// does: every write bumps resourceVersion, spec changes bump generation,
// status writes are guarded by resourceVersion and never emit watch events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;
use rule_engine::crd::{ConfigMap, Engine, EngineStatus, ObjectMeta, RuleSet, RuleSetStatus};
use tokio::sync::broadcast;

use super::{ClusterClient, ClusterError, NamespacedName, ObjectKey, ResourceKind, WatchEvent};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Stored object plumbing
// ============================================================================

trait StoredObject: Clone {
    const KIND: ResourceKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Whether the desired state (everything but metadata and status) matches.
    fn same_spec(&self, other: &Self) -> bool;

    /// Copy the status subresource from the previously stored object.
    fn keep_status(&mut self, previous: &Self);
}

impl StoredObject for RuleSet {
    const KIND: ResourceKind = ResourceKind::RuleSet;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
    fn keep_status(&mut self, previous: &Self) {
        self.status = previous.status.clone();
    }
}

impl StoredObject for Engine {
    const KIND: ResourceKind = ResourceKind::Engine;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
    fn keep_status(&mut self, previous: &Self) {
        self.status = previous.status.clone();
    }
}

impl StoredObject for ConfigMap {
    const KIND: ResourceKind = ResourceKind::ConfigMap;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn same_spec(&self, other: &Self) -> bool {
        self.data == other.data
    }
    fn keep_status(&mut self, _previous: &Self) {}
}

type Objects<T> = BTreeMap<NamespacedName, T>;

#[derive(Default)]
struct ClusterState {
    resource_version: u64,
    rule_sets: Objects<RuleSet>,
    engines: Objects<Engine>,
    config_maps: Objects<ConfigMap>,
}

impl ClusterState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Store `object`. Returns the stored copy and whether anything changed.
fn apply_object<T: StoredObject>(
    objects: &mut Objects<T>,
    resource_version: String,
    mut object: T,
) -> (T, bool) {
    let namespace = object.meta().namespace_or_default().to_string();
    object.meta_mut().namespace = namespace.clone();
    let key = NamespacedName::new(namespace, object.meta().name.clone());

    match objects.get(&key) {
        Some(existing) => {
            let spec_changed = !object.same_spec(existing);
            let labels_changed = object.meta().labels != existing.meta().labels;
            if !spec_changed && !labels_changed {
                return (existing.clone(), false);
            }
            let generation = existing.meta().generation + i64::from(spec_changed);
            object.keep_status(existing);
            object.meta_mut().generation = generation;
        }
        None => object.meta_mut().generation = 1,
    }

    object.meta_mut().resource_version = resource_version;
    objects.insert(key, object.clone());
    (object, true)
}

fn get_object<T: StoredObject>(
    objects: &Objects<T>,
    namespace: &str,
    name: &str,
) -> Result<T, ClusterError> {
    objects
        .get(&NamespacedName::new(namespace, name))
        .cloned()
        .ok_or_else(|| ClusterError::NotFound(ObjectKey::new(T::KIND, namespace, name)))
}

/// Locate `namespace/name` and check the caller's resourceVersion.
fn guarded<'a, T: StoredObject>(
    objects: &'a mut Objects<T>,
    namespace: &str,
    name: &str,
    resource_version: &str,
) -> Result<&'a mut T, ClusterError> {
    let key = ObjectKey::new(T::KIND, namespace, name);
    let object = objects
        .get_mut(&NamespacedName::new(namespace, name))
        .ok_or_else(|| ClusterError::NotFound(key.clone()))?;

    if object.meta().resource_version != resource_version {
        return Err(ClusterError::Conflict {
            key,
            expected: resource_version.to_string(),
            actual: object.meta().resource_version.clone(),
        });
    }
    Ok(object)
}

// ============================================================================
// InMemoryCluster
// ============================================================================

/// Authoritative in-process cluster, used standalone and by tests.
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ClusterState::default()),
            events,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an API server outage: every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ClusterError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClusterError::Unavailable("API server unreachable".to_string()))
        }
    }

    fn emit(&self, event: WatchEvent) {
        debug!("watch event: {:?}", event);
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn apply_rule_set(&self, rule_set: RuleSet) -> RuleSet {
        self.apply(rule_set, |state| &mut state.rule_sets)
    }

    pub fn apply_engine(&self, engine: Engine) -> Engine {
        self.apply(engine, |state| &mut state.engines)
    }

    pub fn apply_config_map(&self, config_map: ConfigMap) -> ConfigMap {
        self.apply(config_map, |state| &mut state.config_maps)
    }

    fn apply<T: StoredObject>(
        &self,
        object: T,
        objects: impl Fn(&mut ClusterState) -> &mut Objects<T>,
    ) -> T {
        let (stored, changed) = {
            let mut state = self.state.write();
            let resource_version = state.next_resource_version();
            apply_object(objects(&mut *state), resource_version, object)
        };

        if changed {
            self.emit(WatchEvent::Applied(ObjectKey::new(
                T::KIND,
                stored.meta().namespace.clone(),
                stored.meta().name.clone(),
            )));
        }
        stored
    }

    /// Delete an object. Returns whether it existed.
    pub fn delete(&self, key: &ObjectKey) -> bool {
        let id = key.namespaced_name();
        let removed = {
            let mut state = self.state.write();
            match key.kind {
                ResourceKind::RuleSet => state.rule_sets.remove(&id).is_some(),
                ResourceKind::Engine => state.engines.remove(&id).is_some(),
                ResourceKind::ConfigMap => state.config_maps.remove(&id).is_some(),
            }
        };
        if removed {
            self.emit(WatchEvent::Deleted(key.clone()));
        }
        removed
    }

    /// Every stored object's key, in a stable order.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let state = self.state.read();
        let mut keys = Vec::new();
        for id in state.rule_sets.keys() {
            keys.push(ObjectKey::rule_set(id.namespace.clone(), id.name.clone()));
        }
        for id in state.engines.keys() {
            keys.push(ObjectKey::engine(id.namespace.clone(), id.name.clone()));
        }
        for id in state.config_maps.keys() {
            keys.push(ObjectKey::config_map(id.namespace.clone(), id.name.clone()));
        }
        keys
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError> {
        self.check_available()?;
        get_object(&self.state.read().config_maps, namespace, name)
    }

    async fn get_rule_set(&self, namespace: &str, name: &str) -> Result<RuleSet, ClusterError> {
        self.check_available()?;
        get_object(&self.state.read().rule_sets, namespace, name)
    }

    async fn get_engine(&self, namespace: &str, name: &str) -> Result<Engine, ClusterError> {
        self.check_available()?;
        get_object(&self.state.read().engines, namespace, name)
    }

    async fn list_rule_sets(&self) -> Result<Vec<RuleSet>, ClusterError> {
        self.check_available()?;
        Ok(self.state.read().rule_sets.values().cloned().collect())
    }

    async fn list_engines(&self) -> Result<Vec<Engine>, ClusterError> {
        self.check_available()?;
        Ok(self.state.read().engines.values().cloned().collect())
    }

    async fn update_rule_set_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: RuleSetStatus,
    ) -> Result<RuleSet, ClusterError> {
        self.check_available()?;
        let mut state = self.state.write();
        let next = state.next_resource_version();
        let rule_set = guarded(&mut state.rule_sets, namespace, name, resource_version)?;
        rule_set.status = status;
        rule_set.metadata.resource_version = next;
        Ok(rule_set.clone())
    }

    async fn update_engine_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: EngineStatus,
    ) -> Result<Engine, ClusterError> {
        self.check_available()?;
        let mut state = self.state.write();
        let next = state.next_resource_version();
        let engine = guarded(&mut state.engines, namespace, name, resource_version)?;
        engine.status = status;
        engine.metadata.resource_version = next;
        Ok(engine.clone())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rule_engine::crd::{ObjectReference, RULE_SOURCE_KIND};

    fn rule_set(sources: &[&str]) -> RuleSet {
        RuleSet::new(
            "waf",
            "default-rules",
            sources.iter().map(|s| ObjectReference::config_map(*s)).collect(),
        )
    }

    #[tokio::test]
    async fn apply_assigns_generation_and_resource_version() {
        let cluster = InMemoryCluster::new();
        let stored = cluster.apply_rule_set(rule_set(&["base"]));
        assert_eq!(stored.metadata.generation, 1);
        assert!(!stored.metadata.resource_version.is_empty());

        let fetched = cluster.get_rule_set("waf", "default-rules").await.unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn spec_change_bumps_generation_and_emits_event() {
        let cluster = InMemoryCluster::new();
        let mut events = cluster.watch();

        cluster.apply_rule_set(rule_set(&["base"]));
        let unchanged = cluster.apply_rule_set(rule_set(&["base"]));
        let changed = cluster.apply_rule_set(rule_set(&["base", "custom"]));

        assert_eq!(unchanged.metadata.generation, 1);
        assert_eq!(changed.metadata.generation, 2);
        assert_eq!(
            events.recv().await.unwrap(),
            WatchEvent::Applied(ObjectKey::rule_set("waf", "default-rules"))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            WatchEvent::Applied(ObjectKey::rule_set("waf", "default-rules"))
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_namespace_defaults() {
        let cluster = InMemoryCluster::new();
        cluster.apply_config_map(ConfigMap::new("", "base").with_data("rules", "rule1\n"));
        assert!(cluster.get_config_map("default", "base").await.is_ok());
    }

    #[tokio::test]
    async fn stale_status_write_conflicts() {
        let cluster = InMemoryCluster::new();
        let stored = cluster.apply_rule_set(rule_set(&["base"]));
        let rv = stored.metadata.resource_version.clone();

        let updated = cluster
            .update_rule_set_status("waf", "default-rules", &rv, RuleSetStatus::default())
            .await
            .unwrap();
        assert_ne!(updated.metadata.resource_version, rv);
        assert_eq!(updated.metadata.generation, 1);

        let err = cluster
            .update_rule_set_status("waf", "default-rules", &rv, RuleSetStatus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));
    }

    #[tokio::test]
    async fn apply_preserves_status() {
        let cluster = InMemoryCluster::new();
        let stored = cluster.apply_rule_set(rule_set(&["base"]));
        let mut status = RuleSetStatus::default();
        status.conditions.push(rule_engine::crd::Condition::new(
            "Ready",
            rule_engine::crd::ConditionStatus::True,
            "RulesCompiled",
            "",
        ));
        cluster
            .update_rule_set_status("waf", "default-rules", &stored.metadata.resource_version, status)
            .await
            .unwrap();

        let reapplied = cluster.apply_rule_set(rule_set(&["custom"]));
        assert_eq!(reapplied.status.conditions.len(), 1);
        assert_eq!(reapplied.spec.rules[0].kind, RULE_SOURCE_KIND);
    }

    #[tokio::test]
    async fn unavailable_cluster_fails_reads() {
        let cluster = InMemoryCluster::new();
        cluster.apply_rule_set(rule_set(&["base"]));
        cluster.set_available(false);
        let err = cluster.get_rule_set("waf", "default-rules").await.unwrap_err();
        assert!(err.is_transient());
        cluster.set_available(true);
        assert!(cluster.get_rule_set("waf", "default-rules").await.is_ok());
    }

    #[tokio::test]
    async fn delete_emits_event_once() {
        let cluster = InMemoryCluster::new();
        cluster.apply_config_map(ConfigMap::new("waf", "base").with_data("rules", "x\n"));
        let mut events = cluster.watch();

        let key = ObjectKey::config_map("waf", "base");
        assert!(cluster.delete(&key));
        assert!(!cluster.delete(&key));
        assert_eq!(events.recv().await.unwrap(), WatchEvent::Deleted(key));
        assert!(events.try_recv().is_err());
    }
}
