//! Cluster resource model for the `waf.k8s.coraza.io/v1alpha1` API.
//!
//! The API server enforces these schemas at admission time; the `validate`
//! methods re-check them here because the compiler and reconciler rely on
//! them.

mod engine;
mod ruleset;
mod types;

use thiserror::Error;

pub use engine::{
    DriverConfig, Engine, EngineSpec, EngineStatus, FailurePolicy, IstioDriverConfig,
    IstioIntegrationMode, IstioWasmConfig, RuleSetCacheServerConfig,
    DEFAULT_POLL_INTERVAL_SECONDS, MAX_POLL_INTERVAL_SECONDS, MIN_POLL_INTERVAL_SECONDS,
};
pub use ruleset::{
    validate_source_reference, RuleSet, RuleSetSpec, RuleSetStatus, MAX_RULE_SOURCES,
    RULE_SOURCE_KIND,
};
pub use types::{
    find_condition, upsert_condition, Condition, ConditionStatus, ConfigMap, LabelSelector,
    LabelSelectorOperator, LabelSelectorRequirement, ObjectMeta, ObjectReference,
    CORE_API_VERSION, DEFAULT_NAMESPACE, WAF_API_VERSION,
};

/// Spec-level violations of the resource schemas.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("metadata.name must not be empty")]
    MissingName,

    #[error("spec.rules must reference at least one source")]
    NoRuleSources,

    #[error("spec.rules references {count} sources, at most {max} are allowed")]
    TooManyRuleSources { count: usize, max: usize },

    #[error("spec.rules[{index}]: only core/v1 ConfigMap sources are supported (got {api_version}/{kind})")]
    UnsupportedRuleSource {
        index: usize,
        kind: String,
        api_version: String,
    },

    #[error("spec.rules[{index}]: reference name must not be empty")]
    EmptyReferenceName { index: usize },

    #[error("cross-namespace reference to {namespace}/{name} is not supported")]
    CrossNamespaceReference { name: String, namespace: String },

    #[error("only waf.k8s.coraza.io/v1alpha1 RuleSet references are supported (got {api_version}/{kind})")]
    UnsupportedRuleSetReference { kind: String, api_version: String },

    #[error("ruleSet name must not be empty")]
    EmptyRuleSetName,

    #[error("workloadSelector is required when mode is gateway")]
    MissingWorkloadSelector,

    #[error("workloadSelector expression for key '{0}' is malformed")]
    InvalidWorkloadSelector(String),

    #[error("invalid plugin image: {0}")]
    InvalidImage(String),

    #[error("pollIntervalSeconds must be between 1 and 3600 (got {0})")]
    PollIntervalOutOfRange(i32),
}
