//! YAML prescription file loader.
//!
//! The prescription names the users to rename and, optionally, extra XML
//! fields that hold user names:
//!
//! ```yaml
//! users:
//!   alice: alice.smith
//!   bob: robert
//! fields:
//!   extra_elements: [approver]
//!   extra_attributes: [approver]
//! ```
//!
//! `user_name_map` is accepted in place of `users`. Any other top-level key
//! is ignored with a warning.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::rules::{RenameRule, RuleSet};

/// Elements whose text content is a user name.
pub const DEFAULT_ELEMENTS: &[&str] = &[
    "administratorUser",
    "assignee",
    "author",
    "lead",
    "memberUser",
    "owner",
    "reporter",
    "username",
];

/// Attributes whose value is, or contains space-separated, user names.
pub const DEFAULT_ATTRIBUTES: &[&str] = &[
    "assignee",
    "author",
    "authorKey",
    "caller",
    "creator",
    "deltaFrom",
    "deltaTo",
    "entityId",
    "lead",
    "lowerChildName",
    "lowerUserName",
    "newvalue",
    "objectName",
    "oldvalue",
    "owner",
    "reporter",
    "roletypeparameter",
    "sourceName",
    "updateauthor",
    "user",
    "username",
];

// ---------------------------------------------------------------------------
// Raw file layout
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PrescriptionFile {
    #[serde(default, alias = "user_name_map")]
    users: Option<HashMap<String, String>>,

    #[serde(default)]
    fields: FieldsSection,

    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

/// Optional `fields` section; both lists extend the built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldsSection {
    #[serde(default)]
    pub extra_elements: Vec<String>,

    #[serde(default)]
    pub extra_attributes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Field set
// ---------------------------------------------------------------------------

/// XML element and attribute names treated as user fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet {
    elements: BTreeSet<String>,
    attributes: BTreeSet<String>,
}

impl Default for FieldSet {
    fn default() -> Self {
        Self {
            elements: DEFAULT_ELEMENTS.iter().map(|s| s.to_string()).collect(),
            attributes: DEFAULT_ATTRIBUTES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FieldSet {
    /// Defaults plus the names listed in a `fields` section.
    pub fn with_extras(section: &FieldsSection) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        for name in &section.extra_elements {
            validate_xml_name("fields.extra_elements", name)?;
            set.elements.insert(name.clone());
        }
        for name in &section.extra_attributes {
            validate_xml_name("fields.extra_attributes", name)?;
            set.attributes.insert(name.clone());
        }
        Ok(set)
    }

    pub fn is_user_element(&self, name: &str) -> bool {
        self.elements.contains(name)
    }

    pub fn is_user_attribute(&self, name: &str) -> bool {
        self.attributes.contains(name)
    }

    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.elements.iter().map(String::as_str)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(String::as_str)
    }
}

fn validate_xml_name(field: &str, name: &str) -> Result<(), ConfigError> {
    let bad = name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '/' | '=' | '"' | '\''));
    if bad {
        return Err(ConfigError::InvalidValue {
            field: field.into(),
            detail: format!("'{}' is not a valid XML name", name),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Prescription
// ---------------------------------------------------------------------------

/// A loaded prescription: what to rename and where to look.
#[derive(Debug, Clone, Default)]
pub struct Prescription {
    pub rules: RuleSet,
    pub fields: FieldSet,
}

impl Prescription {
    /// Load and validate a prescription from a YAML file on disk.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading prescription");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate a prescription from YAML text.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: PrescriptionFile =
            serde_yaml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        for key in file.unknown.keys() {
            warn!(key = %key, "ignoring unrecognized prescription key");
        }

        let users = file
            .users
            .ok_or_else(|| ConfigError::MissingKey("users".into()))?;
        let rules = RuleSet::from_rules(
            users
                .into_iter()
                .map(|(old, new)| RenameRule::new(old, new)),
        )?;
        rules.warn_on_suspicious_rules();

        let fields = FieldSet::with_extras(&file.fields)?;

        debug!(
            rules = rules.len(),
            elements = fields.elements().count(),
            attributes = fields.attributes().count(),
            "prescription parsed successfully"
        );
        Ok(Self { rules, fields })
    }

    /// Prescription with the given rules and the default field set.
    pub fn from_rules(rules: RuleSet) -> Self {
        Self {
            rules,
            fields: FieldSet::default(),
        }
    }
}
