// RuleSet reconciliation: read sources, compile, publish, report.
//
// A failed attempt never touches the version store; only the status
// conditions change, so engines keep receiving the last good version.

use log::{debug, info, warn};
use rule_engine::crd::{Condition, ConditionStatus, RuleSet};
use rule_engine::{PublishOutcome, VersionRecord};

use super::status::{
    update_rule_set_conditions, CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_READY,
};
use super::Context;
use crate::cluster::{NamespacedName, ObjectKey};
use crate::error::ReconcileError;

pub const REASON_PENDING: &str = "Pending";
pub const REASON_COMPILING: &str = "Compiling";
pub const REASON_COMPILED: &str = "Compiled";
pub const REASON_RULES_COMPILED: &str = "RulesCompiled";
pub const REASON_SERVING_LAST_KNOWN_GOOD: &str = "ServingLastKnownGood";
pub const REASON_SOURCE_UNAVAILABLE: &str = "SourceUnavailable";
pub const REASON_SOURCE_INVALID: &str = "SourceInvalid";
pub const REASON_COMPILATION_FAILED: &str = "CompilationFailed";
pub const REASON_INVALID_RULE_SET: &str = "InvalidRuleSet";

/// Where a RuleSet ended up after one reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSetPhase {
    Ready { fingerprint: String, generation: u64 },
    Degraded { reason: &'static str, retryable: bool },
    /// A newer compilation published first; this result was discarded.
    Superseded,
    Deleted,
}

/// The attempt's outcome, before it is rendered into conditions.
enum Evaluation {
    Pending,
    Ready(std::sync::Arc<VersionRecord>),
    Failed {
        reason: &'static str,
        message: String,
        last_good: Option<std::sync::Arc<VersionRecord>>,
    },
}

pub async fn reconcile(ctx: &Context, key: &NamespacedName) -> Result<RuleSetPhase, ReconcileError> {
    let rule_set = match ctx.cluster.get_rule_set(&key.namespace, &key.name).await {
        Ok(rule_set) => rule_set,
        Err(e) if e.is_not_found() => {
            cleanup(ctx, key);
            return Ok(RuleSetPhase::Deleted);
        }
        Err(e) => return Err(e.into()),
    };
    let observed_generation = rule_set.metadata.generation;

    if let Err(e) = rule_set.validate() {
        warn!("RuleSet {} is invalid: {}", key, e);
        let store = ctx.cache.get(key);
        let evaluation = Evaluation::Failed {
            reason: REASON_INVALID_RULE_SET,
            message: e.to_string(),
            last_good: store.and_then(|s| s.read_current().ok()),
        };
        write_conditions(ctx, key, &evaluation, observed_generation).await?;
        return Ok(RuleSetPhase::Degraded {
            reason: REASON_INVALID_RULE_SET,
            retryable: false,
        });
    }

    ctx.source_index.set(
        key,
        rule_set
            .spec
            .rules
            .iter()
            .map(|r| NamespacedName::new(key.namespace.clone(), r.name.clone()))
            .collect(),
    );

    let store = ctx.cache.get_or_create(key);
    if store.read_current().is_err() && !has_ready_condition(&rule_set) {
        write_conditions(ctx, key, &Evaluation::Pending, observed_generation).await?;
    }

    let generation = ctx.generations.next(key);
    let (evaluation, phase) = compile_and_publish(ctx, key, &rule_set, generation).await;

    if phase == RuleSetPhase::Superseded {
        return Ok(phase);
    }

    if matches!(phase, RuleSetPhase::Ready { .. }) {
        for engine in ctx.bindings.engines_for(key) {
            ctx.queue
                .add(ObjectKey::engine(engine.namespace.clone(), engine.name.clone()));
        }
    }

    write_conditions(ctx, key, &evaluation, observed_generation).await?;
    Ok(phase)
}

async fn compile_and_publish(
    ctx: &Context,
    key: &NamespacedName,
    rule_set: &RuleSet,
    generation: u64,
) -> (Evaluation, RuleSetPhase) {
    let store = ctx.cache.get_or_create(key);
    let failed = |reason: &'static str, message: String, retryable: bool| {
        warn!("RuleSet {} generation {} failed: {}", key, generation, message);
        (
            Evaluation::Failed {
                reason,
                message,
                last_good: store.read_current().ok(),
            },
            RuleSetPhase::Degraded { reason, retryable },
        )
    };

    let sources = match ctx.reader.read(&key.namespace, &rule_set.spec.rules).await {
        Ok(sources) => sources,
        Err(e) => return failed(e.reason_code(), e.to_string(), e.is_retryable()),
    };

    let record = match ctx.compiler.compile_record(generation, &sources) {
        Ok(record) => record,
        Err(e) => return failed(REASON_COMPILATION_FAILED, e.to_string(), false),
    };
    let fingerprint = record.fingerprint().to_string();
    let reason = record.reason().map(str::to_string);

    match store.publish(record) {
        Ok(PublishOutcome::Published) => {
            info!(
                "RuleSet {} published generation {} ({})",
                key, generation, fingerprint
            );
        }
        Ok(PublishOutcome::Unchanged) => {
            debug!("RuleSet {} generation {} unchanged", key, generation);
        }
        Ok(PublishOutcome::RejectedInvalid) => {
            return failed(REASON_COMPILATION_FAILED, reason.unwrap_or_default(), false);
        }
        Err(conflict) => {
            debug!("RuleSet {}: {}", key, conflict);
            return (Evaluation::Pending, RuleSetPhase::Superseded);
        }
    }

    match store.read_current() {
        Ok(current) => {
            let phase = RuleSetPhase::Ready {
                fingerprint: current.fingerprint().to_string(),
                generation: current.generation(),
            };
            (Evaluation::Ready(current), phase)
        }
        // A successful publish always leaves a current record.
        Err(e) => failed(REASON_COMPILATION_FAILED, e.to_string(), true),
    }
}

fn has_ready_condition(rule_set: &RuleSet) -> bool {
    rule_set
        .status
        .conditions
        .iter()
        .any(|c| c.type_ == CONDITION_READY && c.reason != REASON_PENDING)
}

fn cleanup(ctx: &Context, key: &NamespacedName) {
    if ctx.cache.remove(key) {
        info!("RuleSet {} deleted, dropped its version store", key);
    }
    ctx.source_index.remove(key);
    ctx.generations.remove(key);
    for engine in ctx.bindings.engines_for(key) {
        ctx.queue
            .add(ObjectKey::engine(engine.namespace.clone(), engine.name.clone()));
    }
}

async fn write_conditions(
    ctx: &Context,
    key: &NamespacedName,
    evaluation: &Evaluation,
    observed_generation: i64,
) -> Result<(), ReconcileError> {
    let conditions: Vec<Condition> = rule_set_conditions(evaluation)
        .into_iter()
        .map(|c| c.with_observed_generation(observed_generation))
        .collect();
    update_rule_set_conditions(ctx, &key.namespace, &key.name, &conditions).await?;
    Ok(())
}

/// Render an evaluation into Ready / Progressing / Degraded.
fn rule_set_conditions(evaluation: &Evaluation) -> [Condition; 3] {
    use ConditionStatus::{False, True};

    match evaluation {
        Evaluation::Pending => [
            Condition::new(CONDITION_READY, False, REASON_PENDING, "waiting for first compilation"),
            Condition::new(CONDITION_PROGRESSING, True, REASON_COMPILING, "compiling rule sources"),
            Condition::new(CONDITION_DEGRADED, False, REASON_PENDING, ""),
        ],
        Evaluation::Ready(current) => {
            let message = format!(
                "serving fingerprint {} (generation {}, {} sources)",
                current.fingerprint(),
                current.generation(),
                current.ruleset().source_count()
            );
            [
                Condition::new(CONDITION_READY, True, REASON_RULES_COMPILED, message),
                Condition::new(CONDITION_PROGRESSING, False, REASON_COMPILED, ""),
                Condition::new(CONDITION_DEGRADED, False, REASON_COMPILED, ""),
            ]
        }
        Evaluation::Failed {
            reason,
            message,
            last_good: Some(current),
        } => [
            Condition::new(
                CONDITION_READY,
                True,
                REASON_SERVING_LAST_KNOWN_GOOD,
                format!(
                    "latest compilation failed, serving fingerprint {} (generation {})",
                    current.fingerprint(),
                    current.generation()
                ),
            ),
            Condition::new(CONDITION_PROGRESSING, False, *reason, ""),
            Condition::new(CONDITION_DEGRADED, True, *reason, message.clone()),
        ],
        Evaluation::Failed {
            reason,
            message,
            last_good: None,
        } => [
            Condition::new(CONDITION_READY, False, *reason, message.clone()),
            Condition::new(CONDITION_PROGRESSING, False, *reason, ""),
            Condition::new(CONDITION_DEGRADED, True, *reason, message.clone()),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rule_engine::{RuleSetCompiler, RuleSource, SourceRef};
    use std::sync::Arc;

    fn record() -> Arc<VersionRecord> {
        let source = RuleSource::new(SourceRef::config_map("base"), "rule1\n").unwrap();
        Arc::new(RuleSetCompiler::new().compile_record(4, &[source]).unwrap())
    }

    fn by_type<'a>(conditions: &'a [Condition], type_: &str) -> &'a Condition {
        conditions.iter().find(|c| c.type_ == type_).unwrap()
    }

    #[test]
    fn pending_conditions() {
        let conditions = rule_set_conditions(&Evaluation::Pending);
        assert_eq!(by_type(&conditions, CONDITION_READY).status, ConditionStatus::False);
        assert_eq!(by_type(&conditions, CONDITION_PROGRESSING).reason, REASON_COMPILING);
        assert!(by_type(&conditions, CONDITION_PROGRESSING).is_true());
        assert!(!by_type(&conditions, CONDITION_DEGRADED).is_true());
    }

    #[test]
    fn ready_conditions() {
        let conditions = rule_set_conditions(&Evaluation::Ready(record()));
        let ready = by_type(&conditions, CONDITION_READY);
        assert!(ready.is_true());
        assert_eq!(ready.reason, REASON_RULES_COMPILED);
        assert!(ready.message.contains("generation 4"));
        assert!(!by_type(&conditions, CONDITION_DEGRADED).is_true());
    }

    #[test]
    fn degraded_with_last_good_stays_ready() {
        let conditions = rule_set_conditions(&Evaluation::Failed {
            reason: REASON_SOURCE_UNAVAILABLE,
            message: "source ConfigMap/custom is unavailable: not found".to_string(),
            last_good: Some(record()),
        });
        let ready = by_type(&conditions, CONDITION_READY);
        assert!(ready.is_true());
        assert_eq!(ready.reason, REASON_SERVING_LAST_KNOWN_GOOD);
        let degraded = by_type(&conditions, CONDITION_DEGRADED);
        assert!(degraded.is_true());
        assert_eq!(degraded.reason, REASON_SOURCE_UNAVAILABLE);
    }

    #[test]
    fn degraded_without_last_good_is_not_ready() {
        let conditions = rule_set_conditions(&Evaluation::Failed {
            reason: REASON_SOURCE_INVALID,
            message: "unbalanced quotes on line 2".to_string(),
            last_good: None,
        });
        let ready = by_type(&conditions, CONDITION_READY);
        assert!(!ready.is_true());
        assert_eq!(ready.reason, REASON_SOURCE_INVALID);
        assert!(by_type(&conditions, CONDITION_DEGRADED).is_true());
    }
}
