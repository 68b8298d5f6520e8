// Rule compiler: merges an ordered list of rule sources into a single
// deterministic ruleset document and fingerprints it.
//
// Design Principles:
// 1. Positional merge - output order is exactly input order
// 2. Deterministic - no timestamps or map iteration in the body
// 3. Side-effect free - compiling twice yields identical bytes
//
// Conflict detection lives in RuleSetValidator; the compiler decides whether
// validation errors abort compilation or produce an invalid VersionRecord.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crd::MAX_RULE_SOURCES;
use crate::directives::{declared_rule_id, logical_lines};
use crate::rule_source::{RuleSource, SourceRef};
use crate::version_store::VersionRecord;

/// Default upper bound on the merged document.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Merged documents above this size compile with a warning.
pub const LARGE_RULE_SET_BYTES: usize = 4 * 1024 * 1024;

// ============================================================================
// Compiled output
// ============================================================================

/// Fingerprint of one constituent source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub reference: SourceRef,
    pub content_hash: String,
}

/// The merged ruleset artifact distributed to engines.
///
/// Never mutated after construction; shared behind `Arc` by the version store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRuleSet {
    /// Lowercase hex SHA-256 of `body`.
    pub fingerprint: String,
    pub generation: u64,
    pub compiled_at: DateTime<Utc>,
    pub body: Arc<str>,
    pub sources: Vec<SourceFingerprint>,
}

impl CompiledRuleSet {
    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

// ============================================================================
// Limits
// ============================================================================

/// Bounds enforced while merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerLimits {
    pub max_sources: usize,
    pub max_body_bytes: usize,
}

impl Default for CompilerLimits {
    fn default() -> Self {
        Self {
            max_sources: MAX_RULE_SOURCES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Where a rule id was declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleLocation {
    pub source: SourceRef,
    pub line: usize,
}

impl fmt::Display for RuleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} line {}", self.source, self.line)
    }
}

/// Validation result with detailed errors
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// All errors joined into one status message.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Conflicts that make a merged ruleset unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate rule id {id}: declared in {first} and {second}")]
    DuplicateRuleId {
        id: u64,
        first: RuleLocation,
        second: RuleLocation,
    },
}

/// Non-fatal findings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// The source holds only comments and blank lines.
    NoDirectives { source: SourceRef },
    LargeRuleSet { bytes: usize },
}

/// Cross-source checks over the ordered source list.
#[derive(Debug, Clone)]
pub struct RuleSetValidator {
    large_rule_set_bytes: usize,
}

impl RuleSetValidator {
    pub fn new() -> Self {
        Self {
            large_rule_set_bytes: LARGE_RULE_SET_BYTES,
        }
    }

    pub fn with_large_rule_set_bytes(mut self, bytes: usize) -> Self {
        self.large_rule_set_bytes = bytes;
        self
    }

    pub fn validate(&self, sources: &[RuleSource]) -> ValidationResult {
        let mut result = ValidationResult::valid();

        self.check_sizes(sources, &mut result);
        self.check_rule_ids(sources, &mut result);

        result
    }

    fn check_sizes(&self, sources: &[RuleSource], result: &mut ValidationResult) {
        let total: usize = sources.iter().map(RuleSource::len).sum();
        if total > self.large_rule_set_bytes {
            result.add_warning(ValidationWarning::LargeRuleSet { bytes: total });
        }
    }

    /// Duplicate `id:` actions across (or within) sources are conflicts.
    fn check_rule_ids(&self, sources: &[RuleSource], result: &mut ValidationResult) {
        let mut seen: HashMap<u64, RuleLocation> = HashMap::new();

        for source in sources {
            let (lines, _) = logical_lines(source.content());
            let mut has_directive = false;

            for line in &lines {
                if line.is_comment() || line.is_blank() {
                    continue;
                }
                has_directive = true;

                let Some(id) = declared_rule_id(line) else {
                    continue;
                };
                let location = RuleLocation {
                    source: source.reference().clone(),
                    line: line.line_number,
                };
                match seen.get(&id) {
                    Some(first) => result.add_error(ValidationError::DuplicateRuleId {
                        id,
                        first: first.clone(),
                        second: location,
                    }),
                    None => {
                        seen.insert(id, location);
                    }
                }
            }

            if !has_directive {
                result.add_warning(ValidationWarning::NoDirectives {
                    source: source.reference().clone(),
                });
            }
        }
    }
}

impl Default for RuleSetValidator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Compiler
// ============================================================================

/// Compilation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompilationError {
    #[error("no rule sources to compile")]
    NoSources,

    #[error("{count} rule sources exceed the limit of {max}")]
    TooManySources { count: usize, max: usize },

    #[error("compiled ruleset is {size} bytes, limit is {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("conflicting directives: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Conflict(Vec<ValidationError>),
}

/// Merges ordered sources into a `CompiledRuleSet`.
#[derive(Debug, Clone, Default)]
pub struct RuleSetCompiler {
    limits: CompilerLimits,
    validator: RuleSetValidator,
}

impl RuleSetCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(mut self, limits: CompilerLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_validator(mut self, validator: RuleSetValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn limits(&self) -> CompilerLimits {
        self.limits
    }

    /// Concatenate sources in order and fingerprint the result. No conflict
    /// checks are run.
    pub fn merge(
        &self,
        generation: u64,
        sources: &[RuleSource],
    ) -> Result<CompiledRuleSet, CompilationError> {
        if sources.is_empty() {
            return Err(CompilationError::NoSources);
        }
        if sources.len() > self.limits.max_sources {
            return Err(CompilationError::TooManySources {
                count: sources.len(),
                max: self.limits.max_sources,
            });
        }

        let capacity: usize = sources.iter().map(|s| s.len() + 1).sum();
        let mut body = String::with_capacity(capacity);
        for source in sources {
            body.push_str(source.content());
            // Keep the last directive of one source from fusing with the next.
            if !source.content().ends_with('\n') {
                body.push('\n');
            }
        }

        if body.len() > self.limits.max_body_bytes {
            return Err(CompilationError::BodyTooLarge {
                size: body.len(),
                max: self.limits.max_body_bytes,
            });
        }

        Ok(CompiledRuleSet {
            fingerprint: format!("{:x}", Sha256::digest(body.as_bytes())),
            generation,
            compiled_at: Utc::now(),
            body: Arc::from(body),
            sources: sources
                .iter()
                .map(|s| SourceFingerprint {
                    reference: s.reference().clone(),
                    content_hash: s.content_hash().to_string(),
                })
                .collect(),
        })
    }

    pub fn validate(&self, sources: &[RuleSource]) -> ValidationResult {
        self.validator.validate(sources)
    }

    /// Merge and validate; any validation error aborts compilation.
    pub fn compile(
        &self,
        generation: u64,
        sources: &[RuleSource],
    ) -> Result<CompiledRuleSet, CompilationError> {
        let compiled = self.merge(generation, sources)?;
        let validation = self.validate(sources);
        if !validation.valid {
            return Err(CompilationError::Conflict(validation.errors));
        }
        Ok(compiled)
    }

    /// Merge and validate, expressing validation errors as an invalid record
    /// rather than an error. Structural failures still return `Err`.
    pub fn compile_record(
        &self,
        generation: u64,
        sources: &[RuleSource],
    ) -> Result<VersionRecord, CompilationError> {
        let compiled = self.merge(generation, sources)?;
        let validation = self.validate(sources);
        for warning in &validation.warnings {
            log::debug!("ruleset generation {generation}: {warning:?}");
        }
        Ok(VersionRecord::from_validation(compiled, &validation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, content: &str) -> RuleSource {
        RuleSource::new(SourceRef::config_map(name), content).unwrap()
    }

    #[test]
    fn merge_concatenates_in_order() {
        let compiler = RuleSetCompiler::new();
        let compiled = compiler
            .merge(1, &[source("base", "rule1\n"), source("custom", "rule2\n")])
            .unwrap();

        assert_eq!(compiled.body(), "rule1\nrule2\n");
        assert_eq!(
            compiled.fingerprint,
            "d5d28c16ab3b6141e48f2db3909235a6df6a96732ec236e05e364ca5580b1148"
        );
        assert_eq!(compiled.source_count(), 2);
        assert_eq!(compiled.sources[0].reference.name, "base");
    }

    #[test]
    fn merge_is_deterministic() {
        let compiler = RuleSetCompiler::new();
        let inputs = [source("a", "SecRuleEngine On\n"), source("b", "SecAction \"id:1\"")];
        let first = compiler.merge(1, &inputs).unwrap();
        let second = compiler.merge(7, &inputs).unwrap();
        assert_eq!(first.body, second.body);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn merge_is_order_sensitive() {
        let compiler = RuleSetCompiler::new();
        let ab = compiler.merge(1, &[source("a", "rule1\n"), source("b", "rule2\n")]).unwrap();
        let ba = compiler.merge(1, &[source("b", "rule2\n"), source("a", "rule1\n")]).unwrap();
        assert_ne!(ab.fingerprint, ba.fingerprint);
    }

    #[test]
    fn missing_trailing_newline_is_added() {
        let compiler = RuleSetCompiler::new();
        let compiled = compiler
            .merge(1, &[source("a", "rule1"), source("b", "rule2")])
            .unwrap();
        assert_eq!(compiled.body(), "rule1\nrule2\n");
    }

    #[test]
    fn enforces_limits() {
        let compiler = RuleSetCompiler::new().with_limits(CompilerLimits {
            max_sources: 1,
            max_body_bytes: 8,
        });
        assert_eq!(compiler.merge(1, &[]), Err(CompilationError::NoSources));
        assert!(matches!(
            compiler.merge(1, &[source("a", "r\n"), source("b", "r\n")]),
            Err(CompilationError::TooManySources { count: 2, max: 1 })
        ));
        assert!(matches!(
            compiler.merge(1, &[source("a", "0123456789\n")]),
            Err(CompilationError::BodyTooLarge { size: 11, max: 8 })
        ));
    }

    #[test]
    fn duplicate_rule_ids_across_sources_conflict() {
        let compiler = RuleSetCompiler::new();
        let inputs = [
            source("base", "SecRule ARGS \"@rx a\" \"id:1001,deny\"\n"),
            source("custom", "# override\nSecRule ARGS \"@rx b\" \"id:1001,pass\"\n"),
        ];

        let err = compiler.compile(3, &inputs).unwrap_err();
        let CompilationError::Conflict(errors) = &err else {
            panic!("expected conflict, got {err:?}");
        };
        assert_eq!(errors.len(), 1);
        let message = err.to_string();
        assert!(message.contains("ConfigMap/base line 1"), "{message}");
        assert!(message.contains("ConfigMap/custom line 2"), "{message}");

        let record = compiler.compile_record(3, &inputs).unwrap();
        assert!(!record.is_valid());
        assert!(record.reason().unwrap().contains("duplicate rule id 1001"));
    }

    #[test]
    fn id_in_operator_text_is_not_a_rule_id() {
        let compiler = RuleSetCompiler::new();
        let inputs = [
            source("base", "SecRule ARGS \"@contains id:9\" \"id:100,phase:2,deny\"\n"),
            source(
                "custom",
                "SecRule REQUEST_URI \"@contains id:9\" \"id:200,phase:2,t:none,msg:'id:9',deny\"\n",
            ),
        ];

        let compiled = compiler.compile(1, &inputs).unwrap();
        assert_eq!(compiled.source_count(), 2);
        assert!(compiler.compile_record(1, &inputs).unwrap().is_valid());
    }

    #[test]
    fn comment_only_source_warns() {
        let validator = RuleSetValidator::new();
        let result = validator.validate(&[source("notes", "# nothing here\n")]);
        assert!(result.valid);
        assert_eq!(
            result.warnings,
            vec![ValidationWarning::NoDirectives {
                source: SourceRef::config_map("notes")
            }]
        );
    }

    #[test]
    fn large_rule_set_warns() {
        let validator = RuleSetValidator::new().with_large_rule_set_bytes(4);
        let result = validator.validate(&[source("a", "SecRuleEngine On\n")]);
        assert!(result.valid);
        assert!(matches!(result.warnings[0], ValidationWarning::LargeRuleSet { .. }));
    }
}
