//! Debug dump of rewritten entries for side-by-side diffing.
//!
//! For every rewritten entry the original text lands at `<dir>/<entry path>`
//! and the rewritten text next to it with a `.proc.xml` extension.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::errors::OutputError;
use crate::models::RewrittenEntry;

/// Entry path reduced to normal components so it stays inside the dump dir.
fn contained_path(entry: &str) -> PathBuf {
    let rel: PathBuf = Path::new(entry)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if rel.as_os_str().is_empty() {
        PathBuf::from("entry.xml")
    } else {
        rel
    }
}

fn processed_path(original: &Path) -> PathBuf {
    original.with_extension("proc.xml")
}

fn write_file(path: &Path, contents: &str) -> Result<(), OutputError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| OutputError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::write(path, contents).map_err(|source| OutputError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Write original and rewritten text of each entry below `dir`.
///
/// Returns the paths of the rewritten (`.proc.xml`) files.
pub fn write_debug_tree(dir: &Path, entries: &[RewrittenEntry]) -> Result<Vec<PathBuf>, OutputError> {
    info!(dir = %dir.display(), entries = entries.len(), "writing debug dump");
    let mut written = Vec::with_capacity(entries.len());

    for entry in entries {
        let original = dir.join(contained_path(&entry.path));
        let processed = processed_path(&original);
        write_file(&original, &entry.original)?;
        write_file(&processed, &entry.rewritten)?;
        debug!(entry = %entry.path, path = %processed.display(), "dumped entry");
        written.push(processed);
    }

    Ok(written)
}
