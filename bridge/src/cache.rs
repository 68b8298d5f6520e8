//! Registry of version stores, one per RuleSet.
//!
//! The map lock is only held to look up or insert a store; publishing and
//! polling go through the store's own lock, so unrelated RuleSets never
//! contend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rule_engine::version_store::{VersionStore, DEFAULT_MAX_HISTORY};

use crate::cluster::NamespacedName;

pub struct RuleSetCache {
    stores: RwLock<HashMap<NamespacedName, Arc<VersionStore>>>,
    max_history: usize,
}

impl RuleSetCache {
    pub fn new(max_history: usize) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            max_history,
        }
    }

    pub fn get(&self, key: &NamespacedName) -> Option<Arc<VersionStore>> {
        self.stores.read().get(key).cloned()
    }

    pub fn get_or_create(&self, key: &NamespacedName) -> Arc<VersionStore> {
        if let Some(store) = self.get(key) {
            return store;
        }
        let mut stores = self.stores.write();
        Arc::clone(
            stores
                .entry(key.clone())
                .or_insert_with(|| Arc::new(VersionStore::with_max_history(self.max_history))),
        )
    }

    /// Drop the store for a deleted RuleSet.
    pub fn remove(&self, key: &NamespacedName) -> bool {
        self.stores.write().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<NamespacedName> {
        let mut keys: Vec<_> = self.stores.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }
}

impl Default for RuleSetCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_same_store() {
        let cache = RuleSetCache::new(3);
        let key = NamespacedName::new("waf", "default-rules");
        let first = cache.get_or_create(&key);
        let second = cache.get_or_create(&key);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.max_history(), 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_drops_store() {
        let cache = RuleSetCache::default();
        let key = NamespacedName::new("waf", "default-rules");
        cache.get_or_create(&key);
        assert!(cache.remove(&key));
        assert!(cache.get(&key).is_none());
        assert!(!cache.remove(&key));
    }
}
