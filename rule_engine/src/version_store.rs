// Version store: the current compiled ruleset for one RuleSet plus a bounded
// history of recently published versions.
//
// Readers never block each other and never observe a partially published
// record: records are immutable and shared through `Arc`, and publishing only
// swaps pointers under the write lock.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::compiler::{CompiledRuleSet, ValidationResult};

/// Default number of records retained in history.
pub const DEFAULT_MAX_HISTORY: usize = 10;

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid { reason: String },
}

/// A compiled ruleset together with its validity verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    ruleset: Arc<CompiledRuleSet>,
    validity: Validity,
}

impl VersionRecord {
    pub fn valid(ruleset: CompiledRuleSet) -> Self {
        Self {
            ruleset: Arc::new(ruleset),
            validity: Validity::Valid,
        }
    }

    pub fn invalid(ruleset: CompiledRuleSet, reason: impl Into<String>) -> Self {
        Self {
            ruleset: Arc::new(ruleset),
            validity: Validity::Invalid {
                reason: reason.into(),
            },
        }
    }

    pub fn from_validation(ruleset: CompiledRuleSet, validation: &ValidationResult) -> Self {
        if validation.valid {
            Self::valid(ruleset)
        } else {
            Self::invalid(ruleset, validation.error_summary())
        }
    }

    pub fn ruleset(&self) -> &Arc<CompiledRuleSet> {
        &self.ruleset
    }

    pub fn fingerprint(&self) -> &str {
        &self.ruleset.fingerprint
    }

    pub fn generation(&self) -> u64 {
        self.ruleset.generation
    }

    pub fn validity(&self) -> &Validity {
        &self.validity
    }

    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    /// Why the record was rejected, if it was.
    pub fn reason(&self) -> Option<&str> {
        match &self.validity {
            Validity::Valid => None,
            Validity::Invalid { reason } => Some(reason),
        }
    }
}

// ============================================================================
// Errors and outcomes
// ============================================================================

/// Nothing has been published yet.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("no ruleset version has been published yet")]
pub struct NoVersionYet;

/// A publish lost the generation race against a newer compilation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("stale publish: generation {attempted} is not newer than generation {current}")]
pub struct PublishConflict {
    pub attempted: u64,
    pub current: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The record became current and was added to history.
    Published,
    /// The record has the current fingerprint; nothing changed.
    Unchanged,
    /// The record is invalid and was not made current.
    RejectedInvalid,
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
struct StoreState {
    current: Option<Arc<VersionRecord>>,
    /// Most recent first.
    history: VecDeque<Arc<VersionRecord>>,
    /// Highest generation accepted so far and the fingerprint it carried.
    high_water: Option<(u64, String)>,
    last_rejected: Option<Arc<VersionRecord>>,
}

/// Current + history of compiled versions for one RuleSet.
pub struct VersionStore {
    state: RwLock<StoreState>,
    max_history: usize,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            max_history: max_history.max(1),
        }
    }

    /// Offer a record to the store.
    ///
    /// Publishes are ordered by generation: a record older than the highest
    /// generation seen (or the same generation with different content) is
    /// stale and rejected with `PublishConflict`.
    pub fn publish(&self, record: VersionRecord) -> Result<PublishOutcome, PublishConflict> {
        let generation = record.generation();
        let mut state = self.state.write();

        if let Some((current, fingerprint)) = &state.high_water {
            let stale = generation < *current
                || (generation == *current && fingerprint != record.fingerprint());
            if stale {
                return Err(PublishConflict {
                    attempted: generation,
                    current: *current,
                });
            }
        }
        state.high_water = Some((generation, record.fingerprint().to_string()));

        if !record.is_valid() {
            log::warn!(
                "rejected ruleset generation {generation} ({}): {}",
                record.fingerprint(),
                record.reason().unwrap_or_default()
            );
            state.last_rejected = Some(Arc::new(record));
            return Ok(PublishOutcome::RejectedInvalid);
        }
        state.last_rejected = None;

        if state
            .current
            .as_ref()
            .is_some_and(|c| c.fingerprint() == record.fingerprint())
        {
            log::debug!("ruleset generation {generation} unchanged");
            return Ok(PublishOutcome::Unchanged);
        }

        let record = Arc::new(record);
        state.history.push_front(Arc::clone(&record));
        state.history.truncate(self.max_history);
        state.current = Some(record);
        Ok(PublishOutcome::Published)
    }

    /// The current valid record.
    pub fn read_current(&self) -> Result<Arc<VersionRecord>, NoVersionYet> {
        self.state.read().current.clone().ok_or(NoVersionYet)
    }

    pub fn current_fingerprint(&self) -> Option<String> {
        self.state
            .read()
            .current
            .as_ref()
            .map(|c| c.fingerprint().to_string())
    }

    /// Up to `limit` most recent published records, newest first.
    pub fn history(&self, limit: usize) -> Vec<Arc<VersionRecord>> {
        self.state.read().history.iter().take(limit).cloned().collect()
    }

    /// Look up a record still retained in history.
    pub fn find(&self, fingerprint: &str) -> Option<Arc<VersionRecord>> {
        self.state
            .read()
            .history
            .iter()
            .find(|r| r.fingerprint() == fingerprint)
            .cloned()
    }

    /// The most recent invalid record, cleared by the next valid publish.
    pub fn last_rejected(&self) -> Option<Arc<VersionRecord>> {
        self.state.read().last_rejected.clone()
    }

    pub fn highest_generation(&self) -> Option<u64> {
        self.state.read().high_water.as_ref().map(|(g, _)| *g)
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("VersionStore")
            .field("current", &state.current.as_ref().map(|c| c.fingerprint().to_string()))
            .field("history_len", &state.history.len())
            .field("max_history", &self.max_history)
            .finish()
    }
}
