use std::path::PathBuf;

use anyhow::{Context, Result};
use arec_adapters::load_roster_bundle;
use arec_catalog::resolve_year_or;
use arec_core::{CohortKey, NaturalKey};
use arec_sync::{
    load_declarations, write_coverage_report, CoverageReport, ReconciliationLayer, SyncConfig,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "arec")]
#[command(about = "Academic records reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the canonical program (and partitions, with --year) for a raw label.
    Canonicalize {
        label: String,
        #[arg(long)]
        year: Option<String>,
    },
    /// Merge cached and remote records for one cohort.
    Reconcile {
        #[arg(long)]
        program: String,
        #[arg(long)]
        year: String,
    },
    /// Look up a registration number or email across every partition.
    Find {
        key: String,
        #[arg(long)]
        all: bool,
    },
    /// Import a roster bundle, skipping keys that already exist.
    Import { bundle: PathBuf },
    /// List cohorts missing expected datasets.
    Gaps {
        #[arg(long)]
        expected: Option<PathBuf>,
        #[arg(long)]
        report: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let layer = ReconciliationLayer::from_config(&config)?;

    match cli.command {
        Commands::Canonicalize { label, year } => {
            let program = layer.catalog().canonicalizer.canonicalize(&label);
            println!("program: {program}");
            if program.is_unknown() {
                if let Some(suggestion) = layer.catalog().canonicalizer.suggest(&label) {
                    println!("did you mean: {suggestion}");
                }
            }
            if let Some(year) = year {
                let resolution = resolve_year_or(&year, 1);
                let cohort = CohortKey::new(program, resolution.year());
                println!(
                    "cohort: {cohort}{}",
                    if resolution.is_defaulted() { " (year defaulted)" } else { "" }
                );
                match layer.catalog().resolver.resolve(&cohort) {
                    Ok(partitions) => {
                        println!("current: {}", partitions.current);
                        for legacy in &partitions.legacy {
                            println!("legacy: {legacy}");
                        }
                    }
                    Err(err) => println!("unmapped: {err}"),
                }
            }
        }
        Commands::Reconcile { program, year } => {
            let cohort = layer.cohort_from_labels(&program, &year)?;
            let snapshot = layer.reconciler().reconcile_cohort_detailed(&cohort).await?;
            if let Some(refresh) = snapshot.refresh {
                let outcome = refresh.await.context("background refresh panicked")?;
                eprintln!("refresh: {outcome:?}");
            }
            println!("{}", serde_json::to_string_pretty(&snapshot.records)?);
            eprintln!(
                "cohort {} -> {} records ({:?})",
                cohort,
                snapshot.records.len(),
                snapshot.origin
            );
        }
        Commands::Find { key, all } => {
            if all {
                let matches = layer.profiles().find_all_by_key(&NaturalKey::parse(&key)).await;
                for found in &matches {
                    println!("{}\t{}", found.partition, serde_json::to_string(&found.record)?);
                }
                eprintln!("{} partition(s) hold {key}", matches.len());
            } else {
                match layer.find_by_key(&key).await {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                    None => eprintln!("no record for {key}"),
                }
            }
        }
        Commands::Import { bundle } => {
            let bundle = load_roster_bundle(&bundle)?;
            let summary = layer.import_bundle(&bundle).await?;
            println!(
                "import complete: imported={} skipped={}",
                summary.imported, summary.skipped
            );
        }
        Commands::Gaps { expected, report } => {
            let path = expected.unwrap_or_else(|| config.expected_path.clone());
            let entries = if path.exists() {
                let declarations = load_declarations(&path)?;
                layer.compute_gaps_from_declarations(&declarations).await?
            } else {
                layer
                    .coverage()
                    .compute_coverage(&layer.default_expectations())
                    .await
            };
            for entry in entries.iter().filter(|e| !e.present) {
                println!(
                    "{}\t{}\t{}",
                    entry.cohort,
                    entry.label,
                    entry.reason.as_deref().unwrap_or("missing")
                );
            }
            if report {
                let report = CoverageReport::new(entries);
                let dir = write_coverage_report(&config.reports_dir, &report).await?;
                println!("report: {}", dir.display());
            }
        }
    }

    Ok(())
}
