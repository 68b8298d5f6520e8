// RuleSet resource: an ordered list of ConfigMap references whose contents
// are compiled into a single ruleset for WAF engines.

use serde::{Deserialize, Serialize};

use super::types::{Condition, ObjectMeta, ObjectReference, CORE_API_VERSION, WAF_API_VERSION};
use super::SpecError;

/// Maximum number of rule sources a RuleSet may reference.
pub const MAX_RULE_SOURCES: usize = 2048;

/// Only core/v1 ConfigMaps may act as rule sources.
pub const RULE_SOURCE_KIND: &str = "ConfigMap";

/// A set of Web Application Firewall rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    #[serde(default = "rule_set_api_version")]
    pub api_version: String,
    #[serde(default = "rule_set_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: RuleSetSpec,
    #[serde(default)]
    pub status: RuleSetStatus,
}

fn rule_set_api_version() -> String {
    WAF_API_VERSION.to_string()
}

fn rule_set_kind() -> String {
    "RuleSet".to_string()
}

/// Desired state of a RuleSet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetSpec {
    /// Ordered references to the objects holding the rules. Order is rule
    /// precedence and is preserved through compilation.
    pub rules: Vec<ObjectReference>,
}

/// Observed state of a RuleSet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleSetStatus {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RuleSet {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, rules: Vec<ObjectReference>) -> Self {
        Self {
            api_version: rule_set_api_version(),
            kind: rule_set_kind(),
            metadata: ObjectMeta::new(namespace, name),
            spec: RuleSetSpec { rules },
            status: RuleSetStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace_or_default()
    }

    /// Re-check the admission rules for this resource.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.metadata.name.is_empty() {
            return Err(SpecError::MissingName);
        }
        self.spec.validate()
    }
}

impl RuleSetSpec {
    /// Validate the source list as the API server's CEL rules would.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.rules.is_empty() {
            return Err(SpecError::NoRuleSources);
        }
        if self.rules.len() > MAX_RULE_SOURCES {
            return Err(SpecError::TooManyRuleSources {
                count: self.rules.len(),
                max: MAX_RULE_SOURCES,
            });
        }

        for (index, reference) in self.rules.iter().enumerate() {
            validate_source_reference(index, reference)?;
        }
        Ok(())
    }
}

/// A single `spec.rules` entry must be a core/v1 ConfigMap with no namespace.
pub fn validate_source_reference(index: usize, reference: &ObjectReference) -> Result<(), SpecError> {
    if reference.kind != RULE_SOURCE_KIND || reference.api_version != CORE_API_VERSION {
        return Err(SpecError::UnsupportedRuleSource {
            index,
            kind: reference.kind.clone(),
            api_version: reference.api_version.clone(),
        });
    }
    if reference.name.is_empty() {
        return Err(SpecError::EmptyReferenceName { index });
    }
    if reference.names_namespace() {
        return Err(SpecError::CrossNamespaceReference {
            name: reference.name.clone(),
            namespace: reference.namespace.clone(),
        });
    }
    Ok(())
}
