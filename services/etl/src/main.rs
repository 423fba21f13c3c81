//! ETL CLI - runs one sales ingest end to end
//!
//! Stages:
//! - Locate the CSV export in the Drive folder and download it
//! - Parse, map headers, check the schema contract
//! - Deduplicate, filter, fill and normalize rows
//! - Write the Parquet artifact (GCS or local directory)
//! - Replace the BigQuery landing table and rebuild the fact table
//!
//! Usage:
//!   # Full run with settings from the environment / .env:
//!   cargo run --bin etl
//!
//!   # Plain sales export, preview only:
//!   cargo run --bin etl -- --variant ventas --dry-run
//!
//!   # Custom variant file:
//!   cargo run --bin etl -- --config config/pipeline.json

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use etl::bootstrap::build_pipeline;
use etl::logging::init_logging;
use etl::warehouse::FactRow;
use etl::{RunLedger, RunOptions, RunOutcome, RunSummary, Settings};

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Runs one sales ingest: fetch, clean, write, load, rebuild")]
struct Args {
    /// Pipeline variant JSON file (overrides PIPELINE_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in variant: facturas or ventas (overrides PIPELINE_VARIANT)
    #[arg(long)]
    variant: Option<String>,

    /// Source file name inside the folder (overrides SOURCE_FILE_NAME)
    #[arg(long)]
    file_name: Option<String>,

    /// Dry run - stop after normalization, write nothing
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Rows shown in the dry-run preview
    #[arg(long, default_value = "5")]
    preview: usize,
}

fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(path) = &args.config {
        settings.pipeline_config = Some(path.clone());
    }
    if let Some(variant) = &args.variant {
        settings.variant = variant.clone();
        // An explicit preset beats a file configured in the environment
        if args.config.is_none() {
            settings.pipeline_config = None;
        }
    }
    if let Some(name) = &args.file_name {
        settings.source_file = name.clone();
    }
}

fn print_preview(rows: &[FactRow]) {
    println!("{:-<100}", "");
    println!(
        "{:<12} {:<16} {:<14} {:<10} {:>5} {:>10} {:>12} {:<5}",
        "fecha", "producto", "categoria", "region", "cant", "precio", "total", "tipo"
    );
    for row in rows {
        let r = &row.record;
        println!(
            "{:<12} {:<16} {:<14} {:<10} {:>5} {:>10} {:>12} {:<5}",
            r.fecha
                .map(|f| f.date().to_string())
                .unwrap_or_else(|| "-".to_string()),
            r.producto,
            r.categoria,
            r.region,
            r.cantidad.map(|c| c.to_string()).unwrap_or_default(),
            r.precio_unitario.map(|p| format!("{:.2}", p)).unwrap_or_default(),
            row.total.map(|t| format!("{:.2}", t)).unwrap_or_default(),
            row.tipo_venta
        );
    }
    println!("{:-<100}", "");
}

fn print_summary(summary: &RunSummary) {
    println!("Run ID: {}", summary.run_id);
    println!("Source: {} ({} bytes, {})", summary.source_id, summary.source_bytes, summary.source_hash);
    println!("Rows parsed: {}", summary.rows_parsed);
    println!("Duplicates dropped: {}", summary.duplicates_dropped);
    println!("Invalid rows dropped: {}", summary.invalid_dropped);
    println!("Null fills: {}", summary.sentinel_fills);
    println!("Unparseable dates: {}", summary.invalid_dates);
    println!("Rows written: {}", summary.rows_written);
    if let Some(artifact) = &summary.artifact {
        println!("Artifact: {} ({} bytes)", artifact.uri, artifact.size_bytes);
    }
    if let Some(job) = &summary.landing_job {
        println!("Landing load job: {}", job);
    }
    if let Some(job) = &summary.fact_job {
        println!("Fact rebuild job: {}", job);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let args = Args::parse();

    let mut settings = Settings::from_env().context("Invalid settings")?;
    apply_overrides(&mut settings, &args);

    println!("=== Sales ETL ===");
    println!("Source: {} (folder {})", settings.source_file, settings.source_folder);

    let pipeline = build_pipeline(&settings, args.dry_run)
        .await
        .context("Failed to configure pipeline")?;
    println!("Variant: {}", pipeline.config().name);

    let ledger = if args.dry_run {
        RunLedger::disabled()
    } else {
        RunLedger::connect(settings.db_url.as_deref()).await
    };
    let job_run_id = ledger.start(&settings.source_file).await;

    let outcome = pipeline
        .run(RunOptions {
            dry_run: args.dry_run,
            preview_rows: if args.dry_run { args.preview } else { 0 },
        })
        .await;

    ledger.finish(job_run_id, &outcome).await;

    match outcome {
        RunOutcome::Success(summary) => {
            if args.dry_run {
                println!("\n=== Dry Run Preview ===");
                print_preview(&summary.preview);
            }
            println!("\n=== Run Complete ===");
            print_summary(&summary);
            Ok(())
        }
        other => {
            let detail = other
                .error_detail()
                .unwrap_or_else(|| "unknown failure".to_string());
            anyhow::bail!("Run {}: {}", other.status(), detail)
        }
    }
}
