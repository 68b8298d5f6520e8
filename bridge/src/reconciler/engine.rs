// Engine reconciliation.
//
// The cache server does not deploy anything itself: it records which
// RuleSet each Engine consumes, reports whether rules are available for it
// and lists the data-plane resource the engine is expected to own.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;
use rule_engine::crd::{
    Condition, ConditionStatus, Engine, FailurePolicy, IstioDriverConfig, ObjectReference,
};

use super::status::{
    update_engine_status, CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_READY,
};
use super::Context;
use crate::cluster::NamespacedName;
use crate::error::ReconcileError;

pub const WASM_PLUGIN_API_VERSION: &str = "extensions.istio.io/v1alpha1";
pub const WASM_PLUGIN_KIND: &str = "WasmPlugin";
const WASM_PLUGIN_PREFIX: &str = "coraza-engine-";

pub const REASON_RULES_AVAILABLE: &str = "RulesAvailable";
pub const REASON_WAITING_FOR_RULE_SET: &str = "WaitingForRuleSet";
pub const REASON_RULE_SET_NOT_FOUND: &str = "RuleSetNotFound";
pub const REASON_SPEC_INVALID: &str = "SpecInvalid";

/// What the reconciler remembers about an Engine between events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineBinding {
    pub engine: NamespacedName,
    pub rule_set: NamespacedName,
    pub failure_policy: FailurePolicy,
    /// `None` when the engine runs with embedded rules and never polls.
    pub poll_interval: Option<Duration>,
    pub image: String,
}

impl EngineBinding {
    pub fn from_engine(engine: &Engine) -> Self {
        let namespace = engine.namespace().to_string();
        let image = match &engine.spec.driver.istio {
            IstioDriverConfig::Wasm(wasm) => wasm.image.clone(),
        };
        Self {
            engine: NamespacedName::new(namespace.clone(), engine.name()),
            rule_set: NamespacedName::new(namespace, engine.spec.rule_set.name.clone()),
            failure_policy: engine.spec.failure_policy,
            poll_interval: engine.spec.poll_interval(),
            image,
        }
    }
}

/// Engine to RuleSet bindings, used to fan RuleSet changes out to engines.
#[derive(Default)]
pub struct BindingRegistry {
    bindings: RwLock<HashMap<NamespacedName, EngineBinding>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous binding, if any.
    pub fn upsert(&self, binding: EngineBinding) -> Option<EngineBinding> {
        self.bindings.write().insert(binding.engine.clone(), binding)
    }

    pub fn remove(&self, engine: &NamespacedName) -> Option<EngineBinding> {
        self.bindings.write().remove(engine)
    }

    pub fn get(&self, engine: &NamespacedName) -> Option<EngineBinding> {
        self.bindings.read().get(engine).cloned()
    }

    /// Engines bound to `rule_set`, sorted.
    pub fn engines_for(&self, rule_set: &NamespacedName) -> Vec<NamespacedName> {
        let mut engines: Vec<_> = self
            .bindings
            .read()
            .values()
            .filter(|b| &b.rule_set == rule_set)
            .map(|b| b.engine.clone())
            .collect();
        engines.sort();
        engines
    }

    /// Every bound engine, sorted.
    pub fn engines(&self) -> Vec<NamespacedName> {
        let mut engines: Vec<_> = self.bindings.read().keys().cloned().collect();
        engines.sort();
        engines
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePhase {
    Ready { fingerprint: String },
    Waiting,
    RuleSetMissing,
    Invalid,
    Deleted,
}

/// Name of the WasmPlugin an Engine owns.
pub fn wasm_plugin_name(engine: &str) -> String {
    format!("{WASM_PLUGIN_PREFIX}{engine}")
}

pub async fn reconcile(ctx: &Context, key: &NamespacedName) -> Result<EnginePhase, ReconcileError> {
    let engine = match ctx.cluster.get_engine(&key.namespace, &key.name).await {
        Ok(engine) => engine,
        Err(e) if e.is_not_found() => {
            if ctx.bindings.remove(key).is_some() {
                info!("Engine {} deleted", key);
            }
            return Ok(EnginePhase::Deleted);
        }
        Err(e) => return Err(e.into()),
    };
    let observed_generation = engine.metadata.generation;

    if let Err(e) = engine.validate() {
        warn!("Engine {} is invalid: {}", key, e);
        ctx.bindings.remove(key);
        let conditions = engine_conditions(
            ConditionStatus::False,
            REASON_SPEC_INVALID,
            e.to_string(),
            true,
        );
        write_status(ctx, key, conditions, observed_generation, &[]).await?;
        return Ok(EnginePhase::Invalid);
    }

    let binding = EngineBinding::from_engine(&engine);
    let rule_set = binding.rule_set.clone();
    if ctx.bindings.upsert(binding.clone()).as_ref() != Some(&binding) {
        debug!(
            "Engine {} bound to RuleSet {} (failurePolicy {}, polling {})",
            key,
            rule_set,
            binding.failure_policy,
            binding
                .poll_interval
                .map(|d| format!("every {}s", d.as_secs()))
                .unwrap_or_else(|| "disabled".to_string())
        );
    }
    let owned = [ObjectReference {
        namespace: key.namespace.clone(),
        ..ObjectReference::new(WASM_PLUGIN_API_VERSION, WASM_PLUGIN_KIND, wasm_plugin_name(&key.name))
    }];

    let (phase, conditions) = match ctx.cluster.get_rule_set(&rule_set.namespace, &rule_set.name).await {
        Err(e) if e.is_not_found() => (
            EnginePhase::RuleSetMissing,
            engine_conditions(
                ConditionStatus::False,
                REASON_RULE_SET_NOT_FOUND,
                format!("RuleSet {} does not exist", rule_set),
                true,
            ),
        ),
        Err(e) => return Err(e.into()),
        Ok(_) => match ctx.cache.get(&rule_set).and_then(|s| s.read_current().ok()) {
            Some(current) => (
                EnginePhase::Ready {
                    fingerprint: current.fingerprint().to_string(),
                },
                engine_conditions(
                    ConditionStatus::True,
                    REASON_RULES_AVAILABLE,
                    format!(
                        "RuleSet {} available at generation {}",
                        rule_set,
                        current.generation()
                    ),
                    false,
                ),
            ),
            None => {
                let mut conditions = engine_conditions(
                    ConditionStatus::False,
                    REASON_WAITING_FOR_RULE_SET,
                    format!("RuleSet {} has no compiled version yet", rule_set),
                    false,
                );
                conditions[1].status = ConditionStatus::True;
                (EnginePhase::Waiting, conditions)
            }
        },
    };

    write_status(ctx, key, conditions, observed_generation, &owned).await?;
    Ok(phase)
}

async fn write_status(
    ctx: &Context,
    key: &NamespacedName,
    conditions: [Condition; 3],
    observed_generation: i64,
    owned: &[ObjectReference],
) -> Result<(), ReconcileError> {
    let conditions: Vec<Condition> = conditions
        .into_iter()
        .map(|c| c.with_observed_generation(observed_generation))
        .collect();
    update_engine_status(ctx, &key.namespace, &key.name, &conditions, owned).await?;
    Ok(())
}

fn engine_conditions(
    ready: ConditionStatus,
    reason: &str,
    message: String,
    degraded: bool,
) -> [Condition; 3] {
    let degraded_status = if degraded {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    [
        Condition::new(CONDITION_READY, ready, reason, message.clone()),
        Condition::new(CONDITION_PROGRESSING, ConditionStatus::False, reason, ""),
        Condition::new(
            CONDITION_DEGRADED,
            degraded_status,
            reason,
            if degraded { message } else { String::new() },
        ),
    ]
}
