//! JIRA export masseur core library.
//!
//! This crate rewrites user names inside JIRA Project Configurator export
//! archives: loading the YAML prescription, scanning the XML entries for
//! user fields, and repacking the archive with the replacements applied.

pub mod archive;
pub mod config;
pub mod dump;
pub mod errors;
pub mod models;
pub mod rules;
pub mod xml;

// Re-exports for convenience.
pub use archive::{default_output_path, massage_export, ExportTransformer, TransformOptions};
pub use config::{FieldSet, Prescription};
pub use errors::CoreError;
pub use models::TransformReport;
pub use rules::{RenameRule, RuleSet};
