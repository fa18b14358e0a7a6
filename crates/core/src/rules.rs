//! Rename rules and the immutable rule set applied during a run.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::errors::ConfigError;

/// A single old-identifier -> new-identifier mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRule {
    /// Identifier as it appears in the export.
    pub old: String,
    /// Identifier written in its place.
    pub new: String,
}

impl RenameRule {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// Mapping from old identifier to new identifier.
///
/// Built once from the prescription and never mutated afterwards. Lookups
/// are exact and case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    map: HashMap<String, String>,
}

impl RuleSet {
    /// Build a rule set, rejecting empty identifiers and duplicate old names.
    pub fn from_rules<I>(rules: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = RenameRule>,
    {
        let mut map = HashMap::new();
        for rule in rules {
            if rule.old.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "users".into(),
                    detail: "old user name must not be empty".into(),
                });
            }
            if rule.new.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("users.{}", rule.old),
                    detail: "new user name must not be empty".into(),
                });
            }
            if map.contains_key(&rule.old) {
                return Err(ConfigError::DuplicateRule(rule.old));
            }
            map.insert(rule.old, rule.new);
        }
        debug!(count = map.len(), "built rule set");
        Ok(Self { map })
    }

    /// New identifier for `old`, if a rule exists.
    pub fn lookup(&self, old: &str) -> Option<&str> {
        self.map.get(old).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Rules sorted by old identifier.
    pub fn rules(&self) -> Vec<RenameRule> {
        let mut rules: Vec<RenameRule> = self
            .map
            .iter()
            .map(|(old, new)| RenameRule::new(old.clone(), new.clone()))
            .collect();
        rules.sort_by(|a, b| a.old.cmp(&b.old));
        rules
    }

    /// Log suspicious but legal rule combinations.
    ///
    /// Returns the number of warnings emitted.
    pub fn warn_on_suspicious_rules(&self) -> usize {
        let mut warnings = 0;
        let mut targets: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for rule in self.rules() {
            if rule.old == rule.new {
                warn!(user = %rule.old, "rename rule maps a user onto itself");
                warnings += 1;
            }
            if rule.old != rule.new && self.map.contains_key(&rule.new) {
                warn!(
                    old = %rule.old,
                    new = %rule.new,
                    "new user name is itself renamed; rules are applied in a single pass"
                );
                warnings += 1;
            }
            if rule.old.contains(char::is_whitespace) || rule.new.contains(char::is_whitespace) {
                warn!(
                    old = %rule.old,
                    new = %rule.new,
                    "user name contains whitespace; it cannot match inside multi-word attributes"
                );
                warnings += 1;
            }
        }

        for (old, new) in &self.map {
            targets.entry(new.as_str()).or_default().push(old.as_str());
        }
        for (new, olds) in targets {
            if olds.len() > 1 {
                warn!(new = %new, merged = olds.len(), "several users are merged into one");
                warnings += 1;
            }
        }

        warnings
    }
}
