//! Principal name rewriting between tenant domains

use serde::{Deserialize, Serialize};

/// One suffix substitution, e.g. `@contoso.com` -> `@fabrikam.com`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Suffix matched on the source principal (ASCII case-insensitive)
    pub source_suffix: String,
    /// Replacement suffix
    pub destination_suffix: String,
}

impl RewriteRule {
    /// Create a rule
    pub fn new(source_suffix: impl Into<String>, destination_suffix: impl Into<String>) -> Self {
        Self {
            source_suffix: source_suffix.into(),
            destination_suffix: destination_suffix.into(),
        }
    }

    fn apply(&self, principal: &str) -> Option<String> {
        if self.source_suffix.is_empty() || principal.len() < self.source_suffix.len() {
            return None;
        }
        let split = principal.len() - self.source_suffix.len();
        if !principal.is_char_boundary(split) {
            return None;
        }
        let (stem, tail) = principal.split_at(split);
        tail.eq_ignore_ascii_case(&self.source_suffix)
            .then(|| format!("{}{}", stem, self.destination_suffix))
    }
}

/// Ordered rule list; the first matching rule wins.
///
/// Callers list the most specific suffixes first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RewriteTable {
    rules: Vec<RewriteRule>,
}

impl RewriteTable {
    /// Table from rules in priority order
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    /// Append a lower-priority rule
    pub fn with_rule(mut self, source_suffix: &str, destination_suffix: &str) -> Self {
        self.rules.push(RewriteRule::new(source_suffix, destination_suffix));
        self
    }

    /// Rules in priority order
    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    /// Rewrite a principal; unmatched input comes back unchanged
    pub fn rewrite(&self, principal: &str) -> String {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(principal))
            .unwrap_or_else(|| principal.to_string())
    }
}
