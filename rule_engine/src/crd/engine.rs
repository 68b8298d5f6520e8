// Engine resource: one WAF engine deployment bound to a RuleSet and a
// driver describing how it is attached to the data plane.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{Condition, LabelSelector, ObjectMeta, ObjectReference, WAF_API_VERSION};
use super::SpecError;

/// Default engine-side poll interval when the cache server block omits it.
pub const DEFAULT_POLL_INTERVAL_SECONDS: i32 = 15;
pub const MIN_POLL_INTERVAL_SECONDS: i32 = 1;
pub const MAX_POLL_INTERVAL_SECONDS: i32 = 3600;

const MAX_IMAGE_LEN: usize = 1024;
const OCI_SCHEME: &str = "oci://";

/// An instance of a Web Application Firewall engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Engine {
    #[serde(default = "engine_api_version")]
    pub api_version: String,
    #[serde(default = "engine_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: EngineSpec,
    #[serde(default)]
    pub status: EngineStatus,
}

fn engine_api_version() -> String {
    WAF_API_VERSION.to_string()
}

fn engine_kind() -> String {
    "Engine".to_string()
}

/// Desired state of an Engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSpec {
    /// The RuleSet whose compiled rules are loaded into this engine.
    pub rule_set: ObjectReference,
    pub driver: DriverConfig,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Observed state of an Engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineStatus {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub owned_resources: Vec<ObjectReference>,
}

/// Behavior of the engine when it is not ready or encounters errors.
///
/// Applied engine-side; the cache server only reports availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Block traffic
    #[default]
    Fail,
    /// Let traffic through
    Allow,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::Allow => write!(f, "allow"),
        }
    }
}

// ============================================================================
// Drivers
// ============================================================================

/// How the engine is deployed. Istio ingress gateways are the only driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub istio: IstioDriverConfig,
}

/// Istio integration mechanism. Exactly one must be given; as an externally
/// tagged enum, a manifest with zero or several mechanisms fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IstioDriverConfig {
    /// Deploy the engine as a WebAssembly plugin.
    Wasm(IstioWasmConfig),
}

/// Where the WASM plugin is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IstioIntegrationMode {
    /// Attach at the Gateway level via Gateway API resources.
    #[default]
    Gateway,
}

impl std::fmt::Display for IstioIntegrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gateway => write!(f, "gateway"),
        }
    }
}

/// Configuration for the Coraza WASM plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IstioWasmConfig {
    #[serde(default)]
    pub mode: IstioIntegrationMode,
    /// Gateway pods the plugin attaches to. Required in gateway mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_selector: Option<LabelSelector>,
    /// OCI image reference of the plugin (`oci://...`).
    pub image: String,
    /// When absent the engine runs with statically embedded rules and never
    /// polls the cache server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_set_cache_server: Option<RuleSetCacheServerConfig>,
}

/// Engine-side polling configuration for the ruleset cache server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetCacheServerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: i32,
}

fn default_poll_interval() -> i32 {
    DEFAULT_POLL_INTERVAL_SECONDS
}

impl Default for RuleSetCacheServerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
        }
    }
}

impl RuleSetCacheServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(MIN_POLL_INTERVAL_SECONDS) as u64)
    }
}

// ============================================================================
// Validation
// ============================================================================

impl Engine {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace_or_default()
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.metadata.name.is_empty() {
            return Err(SpecError::MissingName);
        }
        self.spec.validate()
    }
}

impl EngineSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        let reference = &self.rule_set;
        if reference.kind != "RuleSet" || reference.api_version != WAF_API_VERSION {
            return Err(SpecError::UnsupportedRuleSetReference {
                kind: reference.kind.clone(),
                api_version: reference.api_version.clone(),
            });
        }
        if reference.name.is_empty() {
            return Err(SpecError::EmptyRuleSetName);
        }
        if reference.names_namespace() {
            return Err(SpecError::CrossNamespaceReference {
                name: reference.name.clone(),
                namespace: reference.namespace.clone(),
            });
        }

        match &self.driver.istio {
            IstioDriverConfig::Wasm(wasm) => wasm.validate(),
        }
    }

    /// Engine poll cadence, or `None` when the engine does not poll.
    pub fn poll_interval(&self) -> Option<Duration> {
        match &self.driver.istio {
            IstioDriverConfig::Wasm(wasm) => wasm
                .rule_set_cache_server
                .as_ref()
                .map(RuleSetCacheServerConfig::poll_interval),
        }
    }
}

impl IstioWasmConfig {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.mode == IstioIntegrationMode::Gateway && self.workload_selector.is_none() {
            return Err(SpecError::MissingWorkloadSelector);
        }
        if let Some(selector) = &self.workload_selector {
            if let Some(bad) = selector.match_expressions.iter().find(|r| !r.is_well_formed()) {
                return Err(SpecError::InvalidWorkloadSelector(bad.key.clone()));
            }
        }

        if self.image.is_empty() || self.image.len() > MAX_IMAGE_LEN {
            return Err(SpecError::InvalidImage(format!(
                "image length must be between 1 and {MAX_IMAGE_LEN}"
            )));
        }
        if !self.image.starts_with(OCI_SCHEME) {
            return Err(SpecError::InvalidImage(format!(
                "image '{}' must start with {OCI_SCHEME}",
                self.image
            )));
        }

        if let Some(cache) = &self.rule_set_cache_server {
            let seconds = cache.poll_interval_seconds;
            if !(MIN_POLL_INTERVAL_SECONDS..=MAX_POLL_INTERVAL_SECONDS).contains(&seconds) {
                return Err(SpecError::PollIntervalOutOfRange(seconds));
            }
        }
        Ok(())
    }
}
