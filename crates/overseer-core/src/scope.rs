//! File-scope enforcement: allow/deny glob lists with deny precedence.
//!
//! Paths are compared case-sensitively with forward-slash separators on every
//! host. `**` spans any number of segments (including zero), `*` stays within
//! one segment, and leading dots are not treated as hidden.

use globset::GlobBuilder;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Verdict for a single path.
#[derive(Clone, Debug, Serialize)]
pub struct ScopeDecision {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
}

impl ScopeDecision {
    fn denied_by(pattern: &str) -> Self {
        Self {
            allowed: false,
            reason: format!("path matches deny pattern '{}'", pattern),
            matched_pattern: Some(pattern.to_string()),
        }
    }

    fn allowed_by(pattern: &str) -> Self {
        Self {
            allowed: true,
            reason: format!("path matches allow pattern '{}'", pattern),
            matched_pattern: Some(pattern.to_string()),
        }
    }

    fn not_allowed() -> Self {
        Self {
            allowed: false,
            reason: "not in allow list".to_string(),
            matched_pattern: None,
        }
    }
}

/// Result of a bulk check: per-path verdicts plus the denied subset.
#[derive(Clone, Debug, Serialize)]
pub struct BulkScopeResult {
    pub results: BTreeMap<String, ScopeDecision>,
    pub denied: Vec<String>,
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    let glob = match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(g) => g.compile_matcher(),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid scope pattern treated as non-matching");
            return false;
        }
    };
    glob.is_match(path)
}

/// Check one path against allow/deny lists. Deny always precedes allow; a path
/// matching neither list is denied.
pub fn check(path: &str, allow: &[String], deny: &[String]) -> ScopeDecision {
    let normalized = path.replace('\\', "/");

    for pattern in deny {
        if pattern_matches(pattern, &normalized) {
            return ScopeDecision::denied_by(pattern);
        }
    }
    for pattern in allow {
        if pattern_matches(pattern, &normalized) {
            return ScopeDecision::allowed_by(pattern);
        }
    }
    ScopeDecision::not_allowed()
}

/// Check many paths at once.
pub fn check_all(paths: &[String], allow: &[String], deny: &[String]) -> BulkScopeResult {
    let mut results = BTreeMap::new();
    let mut denied = Vec::new();
    for path in paths {
        let decision = check(path, allow, deny);
        if !decision.allowed {
            denied.push(path.clone());
        }
        results.insert(path.clone(), decision);
    }
    BulkScopeResult { results, denied }
}
