//! Error types for the export masseur core library.
//!
//! Each stage of a run has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

impl CoreError {
    /// Process exit code reported by the CLI for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Archive(_) => 3,
            Self::Output(_) => 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from loading and validating the prescription file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Prescription file not found.
    #[error("prescription file not found: {0}")]
    FileNotFound(String),

    /// The file exists but could not be read.
    #[error("cannot read prescription file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// YAML syntax error or a value of the wrong type.
    #[error("prescription parse error: {0}")]
    ParseError(String),

    /// A required top-level key is absent.
    #[error("prescription is missing the required '{0}' key")]
    MissingKey(String),

    /// Two rules share the same old identifier.
    #[error("duplicate rename rule for '{0}'")]
    DuplicateRule(String),

    /// A value is present but unusable.
    #[error("invalid prescription value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },
}

// ---------------------------------------------------------------------------
// Archive errors
// ---------------------------------------------------------------------------

/// Errors from reading the input export archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The input archive does not exist.
    #[error("export archive not found: {0}")]
    NotFound(String),

    /// The input archive could not be read from disk.
    #[error("cannot read export archive '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The bytes are not a zip container (or the central directory is corrupt).
    #[error("'{path}' is not a valid zip archive: {source}")]
    InvalidZip {
        path: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// A single entry could not be located or decompressed.
    #[error("cannot read archive entry '{entry}': {detail}")]
    Entry { entry: String, detail: String },

    /// An XML entry is structurally broken.
    #[error("malformed XML in '{entry}' at byte {offset}: {detail}")]
    MalformedXml {
        entry: String,
        offset: usize,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Output errors
// ---------------------------------------------------------------------------

/// Errors from writing the transformed archive or the debug dump.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Writing a file or directory failed.
    #[error("cannot write '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The zip writer rejected an entry.
    #[error("cannot write archive entry '{entry}': {source}")]
    Zip {
        entry: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// The finished temporary file could not be moved over the destination.
    #[error("cannot replace '{path}' with the transformed archive: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
