//! Report types produced by a transform run.

use std::path::PathBuf;

use crate::xml::Hits;

// ---------------------------------------------------------------------------
// Per-entry outcome
// ---------------------------------------------------------------------------

/// What happened to a single archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Not an XML document or nested archive; copied as-is.
    Opaque,
    /// Scanned, but nothing matched; copied as-is.
    Unchanged,
    /// User references were replaced.
    Rewritten { replacements: usize },
    /// XML entry that is not UTF-8; copied as-is.
    NotUtf8,
}

impl EntryOutcome {
    /// `true` if the entry content differs from the input.
    pub fn is_rewritten(&self) -> bool {
        matches!(self, Self::Rewritten { .. })
    }

    /// Short human-readable label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Opaque => "opaque",
            Self::Unchanged => "unchanged",
            Self::Rewritten { .. } => "rewritten",
            Self::NotUtf8 => "not-utf8",
        }
    }
}

/// Outcome of one entry, addressed by its path inside the export.
///
/// Entries of a nested archive are addressed as `data.zip/entities.xml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReport {
    pub path: String,
    pub outcome: EntryOutcome,
}

/// Original and rewritten text of an entry, kept for the debug dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenEntry {
    pub path: String,
    pub original: String,
    pub rewritten: String,
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Summary of a whole transform run.
#[derive(Debug, Clone, Default)]
pub struct TransformReport {
    /// Every entry in archive order, nested entries after their archive.
    pub entries: Vec<EntryReport>,
    /// Replacements per old identifier.
    pub hits: Hits,
    /// Filled only when requested through `TransformOptions`.
    pub rewritten: Vec<RewrittenEntry>,
    /// Where the archive was written; `None` for dry runs and debug dumps.
    pub output: Option<PathBuf>,
}

impl TransformReport {
    pub fn total_replacements(&self) -> usize {
        self.hits.values().sum()
    }

    pub fn rewritten_entries(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome.is_rewritten())
            .count()
    }

    pub fn changed(&self) -> bool {
        self.rewritten_entries() > 0
    }
}
