pub mod crd;
pub mod directives;
pub mod rule_source;
pub mod compiler;
pub mod version_store;

pub use crd::{
    Condition, ConditionStatus, ConfigMap, Engine, FailurePolicy, IstioDriverConfig,
    LabelSelector, ObjectMeta, ObjectReference, RuleSet, SpecError,
};

pub use rule_source::{
    check_syntax,           // Syntactic pre-check for raw rule text
    content_hash,           // SHA-256 content hash
    RuleSource,             // Immutable source snapshot
    SourceError,            // Unavailable / invalid source
    SourceRef,              // Source identity (kind + name)
    RULES_DATA_KEY,         // ConfigMap key holding rule text
};

pub use compiler::{
    CompilationError,       // Structural compile failures
    CompiledRuleSet,        // Merged, fingerprinted artifact
    CompilerLimits,         // Source count / body size bounds
    DEFAULT_MAX_BODY_BYTES, // Largest compiled body accepted by default
    RuleSetCompiler,        // Ordered merge + validation
    RuleSetValidator,       // Cross-source conflict detection
    SourceFingerprint,      // Per-source content hash
    ValidationError,        // Validation error types
    ValidationResult,       // Validation outcome
    ValidationWarning,      // Validation warning types
};

pub use version_store::{
    NoVersionYet,           // Read before first publish
    PublishConflict,        // Stale generation
    PublishOutcome,         // Published / unchanged / rejected
    Validity,               // Valid or invalid with reason
    VersionRecord,          // Compiled ruleset + validity
    VersionStore,           // Current + bounded history
};
