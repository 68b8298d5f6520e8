// Rule sources: immutable snapshots of the raw rule text held by a referenced
// object, taken once per compilation attempt.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::directives::{logical_lines, quotes_balanced};

/// ConfigMap data key holding the rule text.
pub const RULES_DATA_KEY: &str = "rules";

/// Upper bound on a single source, matching the ConfigMap size limit.
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;

// ============================================================================
// Source reference
// ============================================================================

/// Stable identity of a rule source within its RuleSet's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: String,
    pub name: String,
}

impl SourceRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn config_map(name: impl Into<String>) -> Self {
        Self::new("ConfigMap", name)
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// ============================================================================
// Source snapshot
// ============================================================================

/// Raw content of one source plus its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSource {
    reference: SourceRef,
    content: Arc<str>,
    content_hash: String,
}

impl RuleSource {
    /// Snapshot `content`, rejecting it if it fails the syntactic check.
    pub fn new(reference: SourceRef, content: impl Into<String>) -> Result<Self, SourceError> {
        let content = content.into();
        check_syntax(&content).map_err(|reason| SourceError::Invalid {
            reference: reference.clone(),
            reason,
        })?;

        Ok(Self {
            content_hash: content_hash(&content),
            content: Arc::from(content),
            reference,
        })
    }

    pub fn reference(&self) -> &SourceRef {
        &self.reference
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Lowercase hex SHA-256 of `content`.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Basic syntactic check applied to every source before compilation.
///
/// This is not a rule parser: it only catches content that would obviously
/// corrupt the merged document.
pub fn check_syntax(content: &str) -> Result<(), String> {
    if content.trim().is_empty() {
        return Err("rule content is empty".to_string());
    }
    if content.len() > MAX_SOURCE_BYTES {
        return Err(format!(
            "rule content is {} bytes, limit is {MAX_SOURCE_BYTES}",
            content.len()
        ));
    }
    if content.contains('\0') {
        return Err("rule content contains a NUL byte".to_string());
    }

    let (lines, dangling) = logical_lines(content);
    if dangling {
        return Err("rule content ends with a dangling line continuation".to_string());
    }
    for line in lines.iter().filter(|l| !l.is_comment() && !l.is_blank()) {
        if !quotes_balanced(&line.text) {
            return Err(format!("unbalanced quotes on line {}", line.line_number));
        }
    }
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// Failure to produce a snapshot for one source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The reference does not resolve, or the backing store is unreachable.
    #[error("source {reference} is unavailable: {reason}")]
    Unavailable { reference: SourceRef, reason: String },

    /// The reference resolves but its content fails the syntactic check.
    #[error("source {reference} is invalid: {reason}")]
    Invalid { reference: SourceRef, reason: String },
}

impl SourceError {
    pub fn reference(&self) -> &SourceRef {
        match self {
            Self::Unavailable { reference, .. } | Self::Invalid { reference, .. } => reference,
        }
    }

    /// Unavailable sources may recover on their own; invalid ones need an edit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Condition reason reported for this failure.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "SourceUnavailable",
            Self::Invalid { .. } => "SourceInvalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_sha256_hex() {
        let source = RuleSource::new(SourceRef::config_map("base"), "rule1\n").unwrap();
        assert_eq!(
            source.content_hash(),
            "c5481ed7a7dbd06d40629d6328dbe550e888872b2535b75e4e930eb3e23761ad"
        );
    }

    #[test]
    fn rejects_blank_content() {
        let err = RuleSource::new(SourceRef::config_map("base"), "  \n\t\n").unwrap_err();
        assert_eq!(err.reason_code(), "SourceInvalid");
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejects_unbalanced_quotes_with_line_number() {
        let content = "# header\nSecRule ARGS \"@rx x\" \"id:1\"\nSecRule ARGS \"@rx y \"id:2\"\n";
        let err = check_syntax(content).unwrap_err();
        assert!(err.contains("line 3"), "{err}");
    }

    #[test]
    fn quotes_in_comments_are_ignored() {
        assert!(check_syntax("# it's \"fine\n SecRuleEngine On\n").is_ok());
    }

    #[test]
    fn rejects_dangling_continuation() {
        assert!(check_syntax("SecRule ARGS \"@rx x\" \\").is_err());
    }

    #[test]
    fn rejects_nul_and_oversized_content() {
        assert!(check_syntax("SecRuleEngine On\0").is_err());
        let big = "#".repeat(MAX_SOURCE_BYTES + 1);
        assert!(check_syntax(&big).is_err());
    }

    #[test]
    fn unavailable_is_retryable() {
        let err = SourceError::Unavailable {
            reference: SourceRef::config_map("custom"),
            reason: "not found".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.reason_code(), "SourceUnavailable");
        assert_eq!(err.to_string(), "source ConfigMap/custom is unavailable: not found");
    }
}
