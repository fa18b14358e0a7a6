//! `massage-jira-export`: rewrite user names in a JIRA Project Configurator
//! export.
//!
//! Reads the export zip, applies the rename rules of a YAML prescription to
//! the user fields of its XML entries, and writes a new zip. A debug mode
//! dumps original and rewritten XML side by side instead of packing.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use jira_export_core::dump::write_debug_tree;
use jira_export_core::models::TransformReport;
use jira_export_core::{
    default_output_path, CoreError, ExportTransformer, Prescription, TransformOptions,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Rewrite user names inside a JIRA Project Configurator export.
#[derive(Parser, Debug)]
#[command(name = "massage-jira-export", version, about)]
struct Cli {
    /// The JIRA project export zip file.
    file: PathBuf,

    /// Path to the YAML prescription file.
    #[arg(short, long, default_value = "prescription.yaml")]
    config: PathBuf,

    /// Where to write the transformed export [default: <FILE stem>.fixed_users.zip].
    #[arg(short, long, conflicts_with_all = ["dry_run", "debug_dir"])]
    output: Option<PathBuf>,

    /// Dump original and rewritten XML entries into DIR instead of packing.
    #[arg(long, value_name = "DIR", conflicts_with = "dry_run")]
    debug_dir: Option<PathBuf>,

    /// Report what would change without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CoreError>())
        .map_or(1, CoreError::exit_code)
}

fn run(cli: Cli) -> Result<()> {
    let prescription = Prescription::load_from_file(&cli.config)
        .map_err(CoreError::from)
        .with_context(|| format!("failed to load prescription {}", cli.config.display()))?;
    debug!(rules = prescription.rules.len(), "prescription loaded");

    let options = TransformOptions {
        keep_rewritten: cli.debug_dir.is_some(),
    };
    let transformer = ExportTransformer::new(&prescription).with_options(options);

    let output = match (&cli.debug_dir, cli.dry_run) {
        (None, false) => Some(
            cli.output
                .clone()
                .unwrap_or_else(|| default_output_path(&cli.file)),
        ),
        _ => None,
    };

    let report = transformer
        .run(&cli.file, output.as_deref())
        .with_context(|| format!("failed to transform {}", cli.file.display()))?;

    if let Some(dir) = &cli.debug_dir {
        let written = write_debug_tree(dir, &report.rewritten)
            .map_err(CoreError::from)
            .with_context(|| format!("failed to write debug dump to {}", dir.display()))?;
        print_summary(&cli.file, &prescription, &report);
        println!();
        println!("Debug dump: {} ({} file(s) to diff)", dir.display(), written.len());
        return Ok(());
    }

    print_summary(&cli.file, &prescription, &report);
    if cli.dry_run {
        println!();
        println!("Dry run: nothing written.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_summary(input: &Path, prescription: &Prescription, report: &TransformReport) {
    println!("Export: {}", input.display());
    println!("=========={}", "=".repeat(input.display().to_string().len()));
    println!();
    println!("  Entries          : {}", report.entries.len());
    println!("  Rewritten entries: {}", report.rewritten_entries());
    println!("  Replacements     : {}", report.total_replacements());
    if let Some(output) = &report.output {
        println!("  Output           : {}", output.display());
    }

    let rules = prescription.rules.rules();
    if rules.is_empty() {
        return;
    }

    println!();
    println!("{:<24} {:<24} {:>8}", "OLD", "NEW", "HITS");
    println!("{}", "-".repeat(58));
    let mut unused = Vec::new();
    for rule in &rules {
        let hits = report.hits.get(&rule.old).copied().unwrap_or(0);
        if hits == 0 {
            unused.push(rule.old.as_str());
        }
        println!(
            "{:<24} {:<24} {:>8}",
            truncate(&rule.old, 24),
            truncate(&rule.new, 24),
            hits
        );
    }

    if !unused.is_empty() {
        println!();
        println!("Rules that matched nothing: {}", unused.join(", "));
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["massage-jira-export", "export.zip"]);
        assert_eq!(cli.file, PathBuf::from("export.zip"));
        assert_eq!(cli.config, PathBuf::from("prescription.yaml"));
        assert!(cli.output.is_none());
        assert!(!cli.dry_run);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_output_conflicts_with_dry_run() {
        let result = Cli::try_parse_from([
            "massage-jira-export",
            "export.zip",
            "--output",
            "out.zip",
            "--dry-run",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_exit_code_from_chain() {
        let err = anyhow::Error::from(CoreError::from(
            jira_export_core::errors::ConfigError::MissingKey("users".into()),
        ))
        .context("failed to load prescription");
        assert_eq!(exit_code(&err), 2);

        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-user-name", 10), "a-very-...");
    }
}
