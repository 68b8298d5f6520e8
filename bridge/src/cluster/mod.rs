//! # Cluster collaborator interface
//!
//! The reconciler and source reader only talk to the cluster through
//! [`ClusterClient`]. Objects are read fresh on every reconcile; watch events
//! carry identities only.

pub mod manifest;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use rule_engine::crd::{ConfigMap, Engine, EngineStatus, RuleSet, RuleSetStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use manifest::{LoadStats, ManifestError, ManifestLoader};
pub use memory::InMemoryCluster;

// ============================================================================
// Object identity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    RuleSet,
    Engine,
    ConfigMap,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleSet => "RuleSet",
            Self::Engine => "Engine",
            Self::ConfigMap => "ConfigMap",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "RuleSet" => Some(Self::RuleSet),
            "Engine" => Some(Self::Engine),
            "ConfigMap" => Some(Self::ConfigMap),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace + name of an object whose kind is known from context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Work-queue key: kind plus namespaced name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn rule_set(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::RuleSet, namespace, name)
    }

    pub fn engine(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Engine, namespace, name)
    }

    pub fn config_map(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ResourceKind::ConfigMap, namespace, name)
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Edge-triggered change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Applied(ObjectKey),
    Deleted(ObjectKey),
}

impl WatchEvent {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Applied(key) | Self::Deleted(key) => key,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("conflict updating {key}: resourceVersion {expected} is stale (current {actual})")]
    Conflict {
        key: ObjectKey,
        expected: String,
        actual: String,
    },

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("invalid object: {0}")]
    Invalid(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Conflicts and outages may clear up on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}

// ============================================================================
// Client trait
// ============================================================================

/// Read, status-write and watch access to the cluster's objects.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError>;

    async fn get_rule_set(&self, namespace: &str, name: &str) -> Result<RuleSet, ClusterError>;

    async fn get_engine(&self, namespace: &str, name: &str) -> Result<Engine, ClusterError>;

    async fn list_rule_sets(&self) -> Result<Vec<RuleSet>, ClusterError>;

    async fn list_engines(&self) -> Result<Vec<Engine>, ClusterError>;

    /// Replace the status of a RuleSet, guarded by `resource_version`.
    async fn update_rule_set_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: RuleSetStatus,
    ) -> Result<RuleSet, ClusterError>;

    /// Replace the status of an Engine, guarded by `resource_version`.
    async fn update_engine_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: EngineStatus,
    ) -> Result<Engine, ClusterError>;

    /// Subscribe to change notifications for RuleSets, Engines and ConfigMaps.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
