//! End-to-end orchestration: multi-plant ingest, then independent per-plant
//! processing from series building to losses, KPIs and data quality.

use crate::anomalies::detect_anomalies;
use crate::config::PipelineConfig;
use crate::dq::{dq_score_plant, DqReport};
use crate::events::{merge_overlapping_events, label_series, EventInterval, EventNormalizer, RawEvent};
use crate::issues::DataIssue;
use crate::kpi::{compute_kpis, get_dc_kwp, KpiReport, PlantMetadata};
use crate::losses::{compute_losses, LossReport};
use crate::model::{fit_expected_power_model, validate_walkforward, ExpectedPowerModel, WalkForwardReport};
use crate::models::{LabeledSeries, LongTable, ResampledTable, ResidualTable, SignalCatalogEntry};
use crate::plant::{build_plant_series, choose_power_level, plant_met_series, PowerLevelDecision, POA_SIGNAL, TMOD_SIGNAL};
use crate::regression::RobustRegressor;
use crate::reshape::{wide_to_long, WideTable};
use crate::signal_mapper::{catalog_issues, SignalMapper};
use crate::timebase::{compute_time_index_audit, resample_signals, TimeIndexAudit};
use rayon::prelude::*;
use std::collections::HashSet;

/// Fleet-wide tables produced before any plant is processed.
#[derive(Debug, Clone, Default)]
pub struct IngestResult {
    pub catalog: Vec<SignalCatalogEntry>,
    pub long: LongTable,
    pub resampled: ResampledTable,
    pub audit: Vec<TimeIndexAudit>,
    pub issues: Vec<DataIssue>,
}

/// Catalog every column of every wide table, melt, audit and resample.
pub fn ingest(tables: &[WideTable], mapper: &SignalMapper, cfg: &PipelineConfig) -> IngestResult {
    let mut seen = HashSet::new();
    let columns: Vec<String> = tables
        .iter()
        .flat_map(|t| t.columns.iter().map(|c| c.name.clone()))
        .filter(|name| seen.insert(name.clone()))
        .collect();

    let catalog = mapper.build_catalog(&columns, &cfg.timestamp_col);
    let issues = catalog_issues(&catalog);
    for issue in &issues {
        log::warn!("{}", issue);
    }

    let mut long = LongTable::default();
    for table in tables {
        long.extend(wide_to_long(table, &catalog));
    }
    let audit = compute_time_index_audit(&long);
    let resampled = resample_signals(&long, cfg);

    IngestResult {
        catalog,
        long,
        resampled,
        audit,
        issues,
    }
}

/// Normalize and merge raw events for the given plants.
pub fn prepare_events(normalizer: &EventNormalizer, raw: &[RawEvent], plants: &[String]) -> Vec<EventInterval> {
    let events = normalizer.normalize_events(raw, plants);
    let merged = merge_overlapping_events(&events);
    log::info!("{} events normalized into {} merged intervals", events.len(), merged.len());
    merged
}

/// Shared, read-only inputs of per-plant processing.
pub struct FleetContext<'a> {
    pub cfg: &'a PipelineConfig,
    pub resampled: &'a ResampledTable,
    pub events: &'a [EventInterval],
    pub metadata: &'a [PlantMetadata],
    pub regressor: &'a dyn RobustRegressor,
}

/// Everything computed for one plant. `ok` reflects the expected-power model;
/// stages that could not run are `None` and their cause is in `issues`.
#[derive(Debug, Clone)]
pub struct PlantReport {
    pub plant_name: String,
    pub ok: bool,
    pub reason: Option<String>,
    pub power_level: PowerLevelDecision,
    pub labeled: Option<LabeledSeries>,
    pub model: Option<ExpectedPowerModel>,
    pub walkforward: Option<WalkForwardReport>,
    pub residuals: Option<ResidualTable>,
    pub losses: Option<LossReport>,
    pub kpis: Option<KpiReport>,
    pub dq: DqReport,
    pub issues: Vec<DataIssue>,
}

impl PlantReport {
    pub fn anomaly_count(&self) -> usize {
        self.residuals.as_ref().map_or(0, ResidualTable::anomaly_count)
    }
}

/// Run every per-plant stage. Stage failures are recorded, never raised.
pub fn process_plant(ctx: &FleetContext<'_>, plant: &str) -> PlantReport {
    let cfg = ctx.cfg;
    let rs = ctx.resampled;
    let dq = dq_score_plant(rs, cfg, plant);
    let mut issues = Vec::new();

    let poa = plant_met_series(rs, plant, POA_SIGNAL);
    let tmod = plant_met_series(rs, plant, TMOD_SIGNAL);
    if poa.is_none() {
        issues.push(DataIssue::MissingSeries(format!("plant {} has no irradiance", plant)));
    }

    let power_level = choose_power_level(rs, cfg, plant, poa.as_ref());
    if power_level.level.is_none() {
        issues.push(DataIssue::MissingSeries(format!(
            "plant {}: {}",
            plant, power_level.reason
        )));
    }

    let series = match build_plant_series(rs, cfg, plant, poa.as_ref(), tmod.as_ref(), power_level.level) {
        Ok(series) => series,
        Err(issue) => {
            log::warn!("Skipping plant {}: {}", plant, issue);
            let reason = Some(issue.to_string());
            issues.push(issue);
            return PlantReport {
                plant_name: plant.to_string(),
                ok: false,
                reason,
                power_level,
                labeled: None,
                model: None,
                walkforward: None,
                residuals: None,
                losses: None,
                kpis: None,
                dq,
                issues,
            };
        }
    };

    let labeled = label_series(series, ctx.events, plant);

    let model = fit_expected_power_model(&labeled, cfg, ctx.regressor);
    if model.ok {
        log::info!(
            "Plant {}: {} model fitted on {} points",
            plant,
            model.backend,
            model.n_train
        );
    } else {
        let reason = model.reason.clone().unwrap_or_default();
        log::warn!("Plant {}: model not fitted ({})", plant, reason);
        issues.push(DataIssue::InsufficientData(format!("plant {}: {}", plant, reason)));
    }
    let walkforward = validate_walkforward(&labeled, cfg, ctx.regressor);

    let p_expected = model.predict(&labeled);
    let residuals = detect_anomalies(&labeled, cfg, &p_expected);
    let losses = compute_losses(&residuals, cfg);
    let kpis = compute_kpis(&labeled, cfg, get_dc_kwp(ctx.metadata, plant));

    PlantReport {
        plant_name: plant.to_string(),
        ok: model.ok,
        reason: model.reason.clone(),
        power_level,
        labeled: Some(labeled),
        model: Some(model),
        walkforward: Some(walkforward),
        residuals: Some(residuals),
        losses: Some(losses),
        kpis: Some(kpis),
        dq,
        issues,
    }
}

/// Plants to process: every named plant, or only the configured one.
pub fn fleet_plants(rs: &ResampledTable, cfg: &PipelineConfig) -> Vec<String> {
    let plants = rs.plant_names();
    match &cfg.selected_plant {
        Some(selected) => {
            if !plants.contains(selected) {
                log::warn!("Selected plant {} not found in the resampled data", selected);
            }
            plants.into_iter().filter(|p| p == selected).collect()
        }
        None => plants,
    }
}

/// Process plants in parallel; reports come back sorted by plant name.
pub fn run_fleet(ctx: &FleetContext<'_>) -> Vec<PlantReport> {
    run_fleet_with(ctx, &fleet_plants(ctx.resampled, ctx.cfg), |_| {})
}

/// Process the given plants in parallel, calling `on_done` as each report
/// finishes (from worker threads, in completion order).
pub fn run_fleet_with<F>(ctx: &FleetContext<'_>, plants: &[String], on_done: F) -> Vec<PlantReport>
where
    F: Fn(&PlantReport) + Sync,
{
    log::info!("Processing {} plants", plants.len());
    let mut reports: Vec<PlantReport> = plants
        .par_iter()
        .map(|p| {
            let report = process_plant(ctx, p);
            on_done(&report);
            report
        })
        .collect();
    reports.sort_by(|a, b| a.plant_name.cmp(&b.plant_name));
    reports
}
