use anyhow::{bail, Context, Result};
use clap::Parser;
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use pv_health::pipeline::{fleet_plants, prepare_events};
use pv_health::{
    ingest, run_fleet_with, EventInterval, EventNormalizer, FleetContext, HuberRegressor,
    PipelineConfig, PlantMetadata, PlantReport, SignalMapper, WideTable,
};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

mod output_writer;
mod scada_loader;

use output_writer::{write_all, OutputFormat, OutputWriter, RunManifest};

#[derive(Parser)]
#[command(name = "pv_fleet_processor")]
#[command(about = "PV fleet health: expected power, anomalies, losses, KPIs and data quality from SCADA exports")]
struct Args {
    /// JSON configuration file (absent keys keep their defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Glob of wide SCADA exports (one or more files, one per plant allowed)
    #[arg(long)]
    scada: Option<String>,

    /// Event log CSV
    #[arg(long)]
    events: Option<PathBuf>,

    /// Plant metadata CSV with a plant_name column
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Directory for output tables
    #[arg(long, default_value = "pv_health_output")]
    output_dir: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "csv")]
    format: OutputFormat,

    /// Process only this plant
    #[arg(long)]
    plant: Option<String>,

    /// Worker threads (defaults to all cores)
    #[arg(long)]
    threads: Option<usize>,
}

fn progress_bar(len: usize, label: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    let template = format!(
        "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{eta}})",
        label
    );
    pb.set_style(ProgressStyle::default_bar().template(&template)?);
    Ok(pb)
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::load_json(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(events) = &args.events {
        cfg.events_path = Some(events.clone());
    }
    if let Some(metadata) = &args.metadata {
        cfg.metadata_path = Some(metadata.clone());
    }
    if let Some(plant) = &args.plant {
        cfg.selected_plant = Some(plant.clone());
    }
    cfg.validate()?;
    Ok(cfg)
}

fn scada_files(args: &Args, cfg: &PipelineConfig) -> Result<Vec<PathBuf>> {
    let pattern = match (&args.scada, &cfg.scada_path) {
        (Some(pattern), _) => pattern.clone(),
        (None, Some(path)) => path.to_string_lossy().into_owned(),
        (None, None) => bail!("no SCADA input: pass --scada or set scada_path in the config"),
    };
    let mut files: Vec<PathBuf> = glob(&pattern)
        .with_context(|| format!("invalid SCADA pattern {}", pattern))?
        .filter_map(Result::ok)
        .collect();
    files.sort();
    if files.is_empty() {
        bail!("no SCADA files match {}", pattern);
    }
    Ok(files)
}

fn load_scada(files: &[PathBuf], cfg: &PipelineConfig) -> Result<Vec<WideTable>> {
    let pb = progress_bar(files.len(), "SCADA files")?;
    let tables = files
        .par_iter()
        .map(|path| {
            let table = scada_loader::load_wide_table(path, cfg);
            pb.inc(1);
            table
        })
        .collect::<Result<Vec<_>>>()?;
    pb.finish_with_message("loaded");
    Ok(tables)
}

fn load_events(cfg: &PipelineConfig, plants: &[String]) -> Result<Vec<EventInterval>> {
    let Some(path) = &cfg.events_path else {
        return Ok(Vec::new());
    };
    let raw = scada_loader::load_events(path, cfg)?;
    let normalizer = EventNormalizer::new()?;
    Ok(prepare_events(&normalizer, &raw, plants))
}

fn load_metadata(cfg: &PipelineConfig) -> Result<Vec<PlantMetadata>> {
    match &cfg.metadata_path {
        Some(path) if path.exists() => scada_loader::load_metadata(path),
        Some(path) => {
            warn!("Metadata file {} not found; specific yield will be empty", path.display());
            Ok(Vec::new())
        }
        None => Ok(Vec::new()),
    }
}

fn run_plants(ctx: &FleetContext<'_>) -> Result<Vec<PlantReport>> {
    let plants = fleet_plants(ctx.resampled, ctx.cfg);
    let pb = progress_bar(plants.len(), "plants")?;
    let reports = run_fleet_with(ctx, &plants, |_| pb.inc(1));
    pb.finish_with_message("done");
    Ok(reports)
}

fn print_summary(reports: &[PlantReport]) {
    println!("\n📊 Fleet Summary");
    println!("{}", "=".repeat(60));
    for report in reports {
        let status = if report.ok { "✅" } else { "❌" };
        println!(
            "{} {:<20} dq {:.2} ({})  anomalies {:>5}  loss {:>10.1} kWh",
            status,
            report.plant_name,
            report.dq.dq_score,
            report.dq.monitoring_confidence,
            report.anomaly_count(),
            report.losses.as_ref().map_or(0.0, |l| l.total_loss_kwh()),
        );
        if let Some(reason) = &report.reason {
            println!("   ⚠️  {}", reason);
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads.unwrap_or_else(num_cpus::get))
        .build_global()?;

    let start = Instant::now();
    println!("🚀 PV Fleet Health Processor");
    println!("{}", "=".repeat(60));

    let cfg = build_config(&args)?;
    info!(
        "Timezone {}, grid {} min, plant filter {:?}",
        cfg.timezone,
        cfg.standard_freq.num_minutes(),
        cfg.selected_plant
    );

    let files = scada_files(&args, &cfg)?;
    println!("📁 Loading {} SCADA files", files.len());
    let tables = load_scada(&files, &cfg)?;

    let mapper = SignalMapper::new()?;
    let ingested = ingest(&tables, &mapper, &cfg);
    let mapped = ingested.catalog.iter().filter(|e| e.mapped).count();
    println!(
        "🗂️  Catalog: {} columns, {} mapped, {} flagged for review",
        ingested.catalog.len(),
        mapped,
        ingested.issues.len()
    );
    println!(
        "⏱️  Resampled {} long rows into {} grid rows",
        ingested.long.len(),
        ingested.resampled.len()
    );

    let plants = ingested.resampled.plant_names();
    let events = load_events(&cfg, &plants)?;
    let metadata = load_metadata(&cfg)?;
    println!("📅 {} event intervals, {} metadata rows", events.len(), metadata.len());

    let regressor = HuberRegressor::default();
    let ctx = FleetContext {
        cfg: &cfg,
        resampled: &ingested.resampled,
        events: &events,
        metadata: &metadata,
        regressor: &regressor,
    };
    let reports = run_plants(&ctx)?;

    let writer = OutputWriter::new(&args.output_dir, args.format)?;
    let written = write_all(
        &writer,
        &ingested.catalog,
        &ingested.audit,
        &ingested.resampled,
        &reports,
    )?;
    writer.write_manifest(&RunManifest::new(&cfg, &files, &reports))?;

    print_summary(&reports);
    println!(
        "\n💾 Wrote {} tables to {}",
        written,
        display_dir(&args.output_dir)
    );
    println!("✨ Finished in {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn display_dir(dir: &Path) -> String {
    dir.canonicalize()
        .unwrap_or_else(|_| dir.to_path_buf())
        .display()
        .to_string()
}
