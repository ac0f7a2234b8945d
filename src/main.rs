use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use msa_pipeline::config::Config;
use msa_pipeline::infra::http_client::ReqwestHttp;
use msa_pipeline::logging;
use msa_pipeline::observability;
use msa_pipeline::pipeline::{Pipeline, RunReport};
use msa_pipeline::types::SourceId;

#[derive(Parser)]
#[command(name = "msa-pipeline")]
#[command(about = "County-to-MSA statistics pipeline: fetch, clean, aggregate, merge")]
#[command(version)]
struct Cli {
    /// Path to the pipeline configuration
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and promote fresh outputs
    Run,
    /// Populate the source cache without processing anything
    Fetch {
        /// Only this source (population, labor, crosswalk, gdp, survey, states, msas)
        #[arg(long)]
        source: Option<SourceId>,
        /// Only this reference year
        #[arg(long)]
        year: Option<i32>,
    },
    /// Fetch and validate the county-to-region crosswalk
    CheckCrosswalk,
}

fn print_summary(report: &RunReport) {
    println!("\n📊 Run {} finished", report.run_id);
    for stats in &report.normalization {
        println!(
            "   {} {}: {} records ({} rows rejected, {:.2}%)",
            stats.source,
            stats.year,
            stats.records,
            stats.rejected,
            stats.rejection_rate * 100.0
        );
    }
    for diag in &report.aggregation {
        println!(
            "   {} {}: {} region metrics, {} unmapped records, {} uncovered counties",
            diag.source, diag.year, diag.aggregates_out, diag.unmapped_records, diag.uncovered_counties
        );
    }
    println!(
        "   Survey regions: {} ({} unmatched)",
        report.merge.survey_regions,
        report.merge.unmatched_survey_regions.len()
    );
    println!(
        "   Geometry: {} MSAs, {} states",
        report.geometry.msas_out, report.geometry.states_out
    );
    for artifact in &report.artifacts {
        println!("   ✅ {} ({})", artifact.file, &artifact.sha256[..12.min(artifact.sha256.len())]);
    }
}

fn write_metrics_snapshot(path: Option<&Path>) {
    let (Some(path), Some(text)) = (path, observability::render()) else {
        return;
    };
    if let Err(e) = fs::write(path, text) {
        warn!("Could not write metrics snapshot to {}: {}", path.display(), e);
    }
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _guard = logging::init_logging(&config.paths.log_dir);
    if let Err(e) = observability::init() {
        warn!("Metrics disabled: {}", e);
    }

    let snapshot = config.paths.metrics_snapshot.clone();
    let http = Arc::new(ReqwestHttp::new().map_err(anyhow::Error::msg)?);
    let pipeline = Pipeline::new(config, http).context("initializing pipeline")?;

    let outcome = match cli.command {
        Commands::Run => {
            println!("🔄 Running MSA pipeline...");
            pipeline.run().map(|report| print_summary(&report))
        }
        Commands::Fetch { source, year } => pipeline.warm_cache(source, year).map(|records| {
            for r in &records {
                let year = r.year.map(|y| format!(" {}", y)).unwrap_or_default();
                println!("   {}{}: {:?} {}", r.source, year, r.origin, r.sha256);
            }
            info!("Warmed {} cache entries", records.len());
        }),
        Commands::CheckCrosswalk => pipeline.check_crosswalk().map(|summary| {
            println!(
                "✅ Crosswalk valid: {} counties, {} regions, {} split counties ({} rows filtered, {} states with a residual region)",
                summary.counties,
                summary.regions,
                summary.split_counties,
                summary.filtered_rows,
                summary.residual_states
            );
        }),
    };

    write_metrics_snapshot(snapshot.as_deref());
    if let Err(e) = &outcome {
        error!("{}", e);
        println!("❌ {}", e);
    }
    outcome.map_err(anyhow::Error::from)
}
