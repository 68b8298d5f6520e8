// Reconciler bookkeeping: which RuleSets read which ConfigMaps, and the
// per-RuleSet compilation generation counters.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cluster::NamespacedName;

/// Reverse index from ConfigMap to the RuleSets whose last read referenced it.
#[derive(Default)]
pub struct SourceIndex {
    by_config_map: RwLock<HashMap<NamespacedName, HashSet<NamespacedName>>>,
    by_rule_set: RwLock<HashMap<NamespacedName, Vec<NamespacedName>>>,
}

impl SourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set of ConfigMaps `rule_set` depends on.
    pub fn set(&self, rule_set: &NamespacedName, config_maps: Vec<NamespacedName>) {
        let mut by_rule_set = self.by_rule_set.write();
        let mut by_config_map = self.by_config_map.write();

        if let Some(previous) = by_rule_set.remove(rule_set) {
            unlink(&mut by_config_map, rule_set, &previous);
        }
        for config_map in &config_maps {
            by_config_map
                .entry(config_map.clone())
                .or_default()
                .insert(rule_set.clone());
        }
        by_rule_set.insert(rule_set.clone(), config_maps);
    }

    pub fn remove(&self, rule_set: &NamespacedName) {
        let mut by_rule_set = self.by_rule_set.write();
        let mut by_config_map = self.by_config_map.write();
        if let Some(previous) = by_rule_set.remove(rule_set) {
            unlink(&mut by_config_map, rule_set, &previous);
        }
    }

    /// RuleSets to recompile when `config_map` changes, sorted.
    pub fn rule_sets_for(&self, config_map: &NamespacedName) -> Vec<NamespacedName> {
        let mut rule_sets: Vec<_> = self
            .by_config_map
            .read()
            .get(config_map)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        rule_sets.sort();
        rule_sets
    }
}

fn unlink(
    by_config_map: &mut HashMap<NamespacedName, HashSet<NamespacedName>>,
    rule_set: &NamespacedName,
    config_maps: &[NamespacedName],
) {
    for config_map in config_maps {
        if let Some(rule_sets) = by_config_map.get_mut(config_map) {
            rule_sets.remove(rule_set);
            if rule_sets.is_empty() {
                by_config_map.remove(config_map);
            }
        }
    }
}

/// Monotonic compilation generation per RuleSet. Process-local.
#[derive(Default)]
pub struct GenerationCounters {
    counters: Mutex<HashMap<NamespacedName, Arc<AtomicU64>>>,
}

impl GenerationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next generation for `rule_set`, starting at 1.
    pub fn next(&self, rule_set: &NamespacedName) -> u64 {
        let counter = Arc::clone(self.counters.lock().entry(rule_set.clone()).or_default());
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn remove(&self, rule_set: &NamespacedName) {
        self.counters.lock().remove(rule_set);
    }
}
