use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rtm_engine::{Coordinator, EngineConfig, ValidationReport, Verdict};
use tracing::instrument;

use super::{OutputFormat, terminal::Colorize};

#[derive(Debug, Parser)]
#[command(about = "Check a snapshot for cycles and one-sided dependencies")]
pub struct Validate {
    /// The snapshot to check
    file: PathBuf,

    /// Add missing reciprocal edges and save the file
    #[arg(long)]
    fix: bool,

    /// Output format
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    output: OutputFormat,
}

impl Validate {
    #[instrument(level = "debug", skip_all, fields(file = %self.file.display()))]
    pub fn run(self, config: EngineConfig) -> anyhow::Result<()> {
        let report = self.check(config)?;

        match self.output {
            OutputFormat::Table => print_table(&report),
            OutputFormat::Json => print_json(&report)?,
        }

        if report.verdict() == Verdict::Flagged {
            std::process::exit(2);
        }

        Ok(())
    }

    /// Validates the file, fixing and saving it first when asked to.
    fn check(&self, config: EngineConfig) -> anyhow::Result<ValidationReport> {
        let coordinator = Coordinator::new(config);
        let mut session = coordinator
            .load(&self.file)
            .with_context(|| format!("failed to read {}", self.file.display()))?;

        if !self.fix {
            return Ok(session.validate().report().clone());
        }

        let fixed = session.fix_reciprocity();
        let session = session.validate();
        if fixed > 0 {
            let saved = session
                .save(&self.file)
                .with_context(|| format!("failed to write {}", self.file.display()))?;
            println!("{}", format!("✓ Added {fixed} reciprocal edges").success());
            return Ok(saved.report().clone());
        }
        Ok(session.report().clone())
    }
}

fn print_table(report: &ValidationReport) {
    if report.cycles.is_empty() {
        println!("✓ Cycles:       none");
    } else {
        println!("{}", format!("✗ Cycles:       {}", report.cycles.len()).failure());
        for cycle in &report.cycles {
            println!("    {cycle}");
        }
    }

    if report.reciprocity.is_empty() {
        println!("✓ Reciprocity:  all edges mirrored");
    } else {
        println!(
            "{}",
            format!("✗ Reciprocity:  {} one-sided edges", report.reciprocity.len()).failure()
        );
        for violation in &report.reciprocity {
            println!("    {}", violation.fix);
        }
    }

    if !report.unknown_references.is_empty() {
        println!(
            "{}",
            format!(
                "! References:   {} unresolved",
                report.unknown_references.len()
            )
            .warning()
        );
        for reference in &report.unknown_references {
            println!("    {}", reference.to_string().dim());
        }
    }

    match report.verdict() {
        Verdict::Clean => println!("\n{}", "Snapshot is consistent".success()),
        Verdict::Flagged => println!("\n{}", "Snapshot needs attention".failure()),
    }
}

fn print_json(report: &ValidationReport) -> anyhow::Result<()> {
    use serde_json::json;

    let output = json!({
        "verdict": report.verdict(),
        "cycles": report.cycles,
        "reciprocity": report.reciprocity,
        "unknown_references": report.unknown_references,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
