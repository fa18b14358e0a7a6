//! The export transformer: zip in, user names rewritten, zip out.
//!
//! A Project Configurator export is a zip holding `config.xml` and a nested
//! `data.zip` with `entities.xml` and `activeobjects.xml`. Every `*.xml`
//! entry is rewritten, every `*.zip` entry is transformed recursively, and
//! everything else is carried over untouched.
//!
//! Entries that do not change are copied raw, so their compressed bytes and
//! headers are preserved. When no entry changes at all, the output is a
//! byte copy of the input.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config::Prescription;
use crate::errors::{ArchiveError, CoreError, OutputError};
use crate::models::{EntryOutcome, EntryReport, RewrittenEntry, TransformReport};
use crate::xml::{rewrite_document, Hits};

/// Suffix inserted before `.zip` in the default output name.
pub const OUTPUT_SUFFIX: &str = "fixed_users";

/// Knobs for a transform run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformOptions {
    /// Keep original and rewritten text of changed entries in the report.
    pub keep_rewritten: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Xml,
    Nested,
    Opaque,
}

fn classify(name: &str, is_dir: bool) -> EntryKind {
    if is_dir {
        return EntryKind::Opaque;
    }
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("xml") => EntryKind::Xml,
        Some(ext) if ext.eq_ignore_ascii_case("zip") => EntryKind::Nested,
        _ => EntryKind::Opaque,
    }
}

/// Default output path: `export.zip` becomes `export.fixed_users.zip`.
pub fn default_output_path(input: &Path) -> PathBuf {
    let base = match input.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("zip") => input.file_stem(),
        _ => input.file_name(),
    };
    let base = base
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    input.with_file_name(format!("{}.{}.zip", base, OUTPUT_SUFFIX))
}

// ---------------------------------------------------------------------------
// Transformer
// ---------------------------------------------------------------------------

/// Applies a prescription to export archives.
pub struct ExportTransformer<'a> {
    prescription: &'a Prescription,
    options: TransformOptions,
}

impl<'a> ExportTransformer<'a> {
    pub fn new(prescription: &'a Prescription) -> Self {
        Self {
            prescription,
            options: TransformOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransformOptions) -> Self {
        self.options = options;
        self
    }

    /// Transform the archive at `input`.
    ///
    /// With `output` set, the result is written there atomically (the input
    /// path itself is allowed). With `None` nothing is written.
    pub fn run(&self, input: &Path, output: Option<&Path>) -> Result<TransformReport, CoreError> {
        info!(
            input = %input.display(),
            rules = self.prescription.rules.len(),
            "transforming export"
        );
        let original = read_export(input)?;

        let mut report = TransformReport::default();
        let label = input.display().to_string();
        let transformed = self.transform_bytes(&label, &original, &mut report)?;

        if let Some(output) = output {
            let bytes = transformed.as_deref().unwrap_or(&original);
            write_output(output, bytes)?;
            info!(output = %output.display(), bytes = bytes.len(), "wrote transformed export");
            report.output = Some(output.to_path_buf());
        }

        for entry in &report.entries {
            debug!(entry = %entry.path, outcome = entry.outcome.label(), "entry processed");
        }
        info!(
            entries = report.entries.len(),
            rewritten = report.rewritten_entries(),
            replacements = report.total_replacements(),
            "transform finished"
        );
        Ok(report)
    }

    /// Transform archive bytes in memory.
    ///
    /// Returns `Ok(None)` when no entry changed. `label` names the archive in
    /// error messages.
    pub fn transform_bytes(
        &self,
        label: &str,
        bytes: &[u8],
        report: &mut TransformReport,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        self.transform_archive(label, "", bytes, report)
    }

    fn transform_archive(
        &self,
        label: &str,
        prefix: &str,
        bytes: &[u8],
        report: &mut TransformReport,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).map_err(|source| ArchiveError::InvalidZip {
                path: label.to_string(),
                source,
            })?;
        debug!(archive = label, entries = archive.len(), "opened archive");

        let mut replacements: Vec<Option<Vec<u8>>> = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let (name, is_dir) = {
                let file = archive
                    .by_index_raw(index)
                    .map_err(|e| entry_error(&format!("{}#{}", label, index), e))?;
                (file.name().to_string(), file.is_dir())
            };
            let path = format!("{}{}", prefix, name);

            let replacement = match classify(&name, is_dir) {
                EntryKind::Opaque => {
                    debug!(entry = %path, "passing through opaque entry");
                    report.entries.push(EntryReport {
                        path,
                        outcome: EntryOutcome::Opaque,
                    });
                    None
                }
                EntryKind::Xml => {
                    let data = read_entry(&mut archive, index, &path)?;
                    self.rewrite_xml(path, data, report)?
                }
                EntryKind::Nested => {
                    let data = read_entry(&mut archive, index, &path)?;
                    let slot = report.entries.len();
                    report.entries.push(EntryReport {
                        path: path.clone(),
                        outcome: EntryOutcome::Unchanged,
                    });
                    let before = report.total_replacements();
                    let nested_prefix = format!("{}/", path);
                    let nested = self.transform_archive(&path, &nested_prefix, &data, report)?;
                    if nested.is_some() {
                        report.entries[slot].outcome = EntryOutcome::Rewritten {
                            replacements: report.total_replacements() - before,
                        };
                    }
                    nested
                }
            };
            replacements.push(replacement);
        }

        if replacements.iter().all(Option::is_none) {
            debug!(archive = label, "no entry changed");
            return Ok(None);
        }
        self.repack(label, &mut archive, replacements).map(Some)
    }

    fn rewrite_xml(
        &self,
        path: String,
        data: Vec<u8>,
        report: &mut TransformReport,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        let text = match String::from_utf8(data) {
            Ok(text) => text,
            Err(_) => {
                warn!(entry = %path, "XML entry is not UTF-8, copying unchanged");
                report.entries.push(EntryReport {
                    path,
                    outcome: EntryOutcome::NotUtf8,
                });
                return Ok(None);
            }
        };

        let mut hits = Hits::new();
        let rewritten = rewrite_document(
            &path,
            &text,
            &self.prescription.rules,
            &self.prescription.fields,
            &mut hits,
        )?;

        let Some(rewritten) = rewritten else {
            report.entries.push(EntryReport {
                path,
                outcome: EntryOutcome::Unchanged,
            });
            return Ok(None);
        };

        let count: usize = hits.values().sum();
        info!(entry = %path, replacements = count, "rewrote user references");
        for (old, n) in hits {
            *report.hits.entry(old).or_insert(0) += n;
        }
        if self.options.keep_rewritten {
            report.rewritten.push(RewrittenEntry {
                path: path.clone(),
                original: text,
                rewritten: rewritten.clone(),
            });
        }
        report.entries.push(EntryReport {
            path,
            outcome: EntryOutcome::Rewritten {
                replacements: count,
            },
        });
        Ok(Some(rewritten.into_bytes()))
    }

    /// Write a new archive: raw copies for unchanged entries, fresh entries
    /// with the original metadata for changed ones.
    fn repack(
        &self,
        label: &str,
        archive: &mut ZipArchive<Cursor<&[u8]>>,
        replacements: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<u8>, CoreError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        for (index, replacement) in replacements.into_iter().enumerate() {
            let file = archive
                .by_index_raw(index)
                .map_err(|e| entry_error(&format!("{}#{}", label, index), e))?;
            let name = file.name().to_string();

            let Some(data) = replacement else {
                writer
                    .raw_copy_file(file)
                    .map_err(|source| OutputError::Zip {
                        entry: name.clone(),
                        source,
                    })?;
                continue;
            };

            let method = writable_method(file.compression(), &name);
            let mut options: FileOptions<'_, ()> = FileOptions::default()
                .compression_method(method)
                .large_file(data.len() as u64 >= u64::from(u32::MAX));
            if let Some(modified) = file.last_modified() {
                options = options.last_modified_time(modified);
            }
            if let Some(mode) = file.unix_mode() {
                options = options.unix_permissions(mode);
            }
            drop(file);

            writer
                .start_file(name.as_str(), options)
                .map_err(|source| OutputError::Zip {
                    entry: name.clone(),
                    source,
                })?;
            writer.write_all(&data).map_err(|source| OutputError::Io {
                path: format!("{}/{}", label, name),
                source,
            })?;
        }

        let cursor = writer.finish().map_err(|source| OutputError::Zip {
            entry: label.to_string(),
            source,
        })?;
        Ok(cursor.into_inner())
    }
}

/// Load rules from `prescription` and apply them to `input`, writing `output`.
///
/// Convenience wrapper around [`ExportTransformer`] with default options.
pub fn massage_export(
    input: &Path,
    prescription: &Prescription,
    output: &Path,
) -> Result<TransformReport, CoreError> {
    ExportTransformer::new(prescription).run(input, Some(output))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn entry_error(entry: &str, err: zip::result::ZipError) -> ArchiveError {
    ArchiveError::Entry {
        entry: entry.to_string(),
        detail: err.to_string(),
    }
}

fn read_entry(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    index: usize,
    path: &str,
) -> Result<Vec<u8>, ArchiveError> {
    let mut file = archive
        .by_index(index)
        .map_err(|e| entry_error(path, e))?;
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)
        .map_err(|e| ArchiveError::Entry {
            entry: path.to_string(),
            detail: e.to_string(),
        })?;
    Ok(data)
}

/// The writer only produces stored and deflated entries.
fn writable_method(method: CompressionMethod, entry: &str) -> CompressionMethod {
    match method {
        CompressionMethod::Stored => CompressionMethod::Stored,
        CompressionMethod::Deflated => CompressionMethod::Deflated,
        other => {
            warn!(entry, method = ?other, "cannot recompress with original method, using deflate");
            CompressionMethod::Deflated
        }
    }
}

fn read_export(path: &Path) -> Result<Vec<u8>, ArchiveError> {
    if !path.exists() {
        return Err(ArchiveError::NotFound(path.display().to_string()));
    }
    fs::read(path).map_err(|source| ArchiveError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Write `bytes` to `path` through a temporary file in the same directory.
fn write_output(path: &Path, bytes: &[u8]) -> Result<(), OutputError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io_err = |source| OutputError::Io {
        path: path.display().to_string(),
        source,
    };

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|source| OutputError::Io {
            path: dir.display().to_string(),
            source,
        })?;
    }

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| OutputError::Persist {
        path: path.display().to_string(),
        source: e.error,
    })?;
    debug!(path = %path.display(), "persisted output");
    Ok(())
}
