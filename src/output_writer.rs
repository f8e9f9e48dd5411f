use anyhow::{Context, Result};
use clap::ValueEnum;
use polars::prelude::*;
use pv_health::dq::DqReport;
use pv_health::kpi::{DailyKpi, MonthlyKpi};
use pv_health::losses::DailyLoss;
use pv_health::model::WalkForwardReport;
use pv_health::timebase::TimeIndexAudit;
use pv_health::{EventLabel, PlantReport, ResampledTable, SignalCatalogEntry, Timestamp};
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Csv,
    Parquet,
    Both,
}

/// Writes named DataFrames into one output directory.
pub struct OutputWriter {
    dir: PathBuf,
    format: OutputFormat,
}

impl OutputWriter {
    pub fn new(dir: &Path, format: OutputFormat) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            format,
        })
    }

    /// Write `df` as `<name>.csv` and/or `<name>.parquet`; returns the files written.
    pub fn write(&self, name: &str, df: &mut DataFrame) -> Result<Vec<PathBuf>> {
        let stem = file_stem(name);
        let mut written = Vec::new();

        if matches!(self.format, OutputFormat::Csv | OutputFormat::Both) {
            let path = self.dir.join(format!("{}.csv", stem));
            CsvWriter::new(File::create(&path)?)
                .has_header(true)
                .finish(df)
                .with_context(|| format!("writing {}", path.display()))?;
            written.push(path);
        }
        if matches!(self.format, OutputFormat::Parquet | OutputFormat::Both) {
            let path = self.dir.join(format!("{}.parquet", stem));
            ParquetWriter::new(File::create(&path)?)
                .finish(df)
                .with_context(|| format!("writing {}", path.display()))?;
            written.push(path);
        }

        log::debug!("Wrote {} ({} rows)", stem, df.height());
        Ok(written)
    }
}

/// Plant names become file names: anything outside `[A-Za-z0-9_-]` turns into `_`.
pub fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn ts_strings(ts: &[Timestamp]) -> Vec<String> {
    ts.iter().map(|t| t.to_rfc3339()).collect()
}

fn opt_ts_strings<'a>(ts: impl Iterator<Item = &'a Option<Timestamp>>) -> Vec<Option<String>> {
    ts.map(|t| t.map(|t| t.to_rfc3339())).collect()
}

pub fn catalog_frame(catalog: &[SignalCatalogEntry]) -> Result<DataFrame> {
    let text = |f: fn(&SignalCatalogEntry) -> Option<String>| -> Vec<Option<String>> {
        catalog.iter().map(f).collect()
    };
    let df = DataFrame::new(vec![
        Series::new("raw_column_name", text(|e| Some(e.raw_column_name.clone()))),
        Series::new("plant_name", text(|e| e.plant_name.clone())),
        Series::new("component_type", text(|e| Some(e.component_type.to_string()))),
        Series::new("component_id", text(|e| Some(e.component_id.clone()))),
        Series::new("raw_signal_name", text(|e| Some(e.raw_signal_name.clone()))),
        Series::new("unit_raw", text(|e| e.unit_raw.clone())),
        Series::new("unit", text(|e| e.unit.clone())),
        Series::new("canonical_signal", text(|e| Some(e.canonical_signal.clone()))),
        Series::new("mapped", catalog.iter().map(|e| e.mapped).collect::<Vec<_>>()),
        Series::new("pattern", text(|e| e.pattern.clone())),
        Series::new("expected_unit", text(|e| e.expected_unit.clone())),
        Series::new("unit_ok", catalog.iter().map(|e| e.unit_ok).collect::<Vec<_>>()),
    ])?;
    Ok(df)
}

pub fn audit_frame(audit: &[TimeIndexAudit]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new("plant_name", audit.iter().map(|a| a.plant_name.clone()).collect::<Vec<_>>()),
        Series::new("min_ts", opt_ts_strings(audit.iter().map(|a| &a.min_ts))),
        Series::new("max_ts", opt_ts_strings(audit.iter().map(|a| &a.max_ts))),
        Series::new("dup_frac", audit.iter().map(|a| a.dup_frac).collect::<Vec<_>>()),
        Series::new("median_dt_min", audit.iter().map(|a| a.median_dt_min).collect::<Vec<_>>()),
        Series::new("n", audit.iter().map(|a| a.n as u64).collect::<Vec<_>>()),
    ])?;
    Ok(df)
}

pub fn resampled_frame(rs: &ResampledTable) -> Result<DataFrame> {
    let records = &rs.records;
    let df = DataFrame::new(vec![
        Series::new("ts", records.iter().map(|r| r.ts.to_rfc3339()).collect::<Vec<_>>()),
        Series::new(
            "plant_name",
            records.iter().map(|r| r.key.plant_name.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "component_type",
            records.iter().map(|r| r.key.component_type.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            "component_id",
            records.iter().map(|r| r.key.component_id.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            "canonical_signal",
            records.iter().map(|r| r.key.canonical_signal.as_str()).collect::<Vec<_>>(),
        ),
        Series::new("unit", records.iter().map(|r| r.key.unit.clone()).collect::<Vec<_>>()),
        Series::new(
            "signal_type",
            records.iter().map(|r| r.signal_type.as_str()).collect::<Vec<_>>(),
        ),
        Series::new("value_rs", records.iter().map(|r| r.value_rs).collect::<Vec<_>>()),
    ])?;
    Ok(df)
}

pub fn dq_frame(reports: &[DqReport]) -> Result<DataFrame> {
    let frac = |f: fn(&DqReport) -> Option<f64>| -> Vec<Option<f64>> { reports.iter().map(f).collect() };
    let score = |f: fn(&DqReport) -> f64| -> Vec<f64> { reports.iter().map(f).collect() };
    let df = DataFrame::new(vec![
        Series::new("plant_name", reports.iter().map(|r| r.plant_name.as_str()).collect::<Vec<_>>()),
        Series::new("poa_missing_frac_day", frac(|r| r.poa_missing_frac_day)),
        Series::new("tmod_missing_frac_day", frac(|r| r.tmod_missing_frac_day)),
        Series::new("p_missing_frac_day", frac(|r| r.p_missing_frac_day)),
        Series::new("poa_oob_frac", frac(|r| r.poa_oob_frac)),
        Series::new("tmod_oob_frac", frac(|r| r.tmod_oob_frac)),
        Series::new("pf_oob_frac", frac(|r| r.pf_oob_frac)),
        Series::new("poa_stuck_frac", frac(|r| r.poa_stuck_frac)),
        Series::new("tmod_stuck_frac", frac(|r| r.tmod_stuck_frac)),
        Series::new("counter_reset_frac", frac(|r| r.counter_reset_frac)),
        Series::new("completeness_score", score(|r| r.completeness_score)),
        Series::new("plausibility_score", score(|r| r.plausibility_score)),
        Series::new("stuck_score", score(|r| r.stuck_score)),
        Series::new("counter_score", score(|r| r.counter_score)),
        Series::new("dq_score", score(|r| r.dq_score)),
        Series::new(
            "monitoring_confidence",
            reports.iter().map(|r| r.monitoring_confidence.to_string()).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

/// The plant series with labels, residuals, anomalies and per-row losses.
/// `None` when the plant never got a series.
pub fn timeseries_frame(report: &PlantReport) -> Result<Option<DataFrame>> {
    let Some(labeled) = &report.labeled else {
        return Ok(None);
    };
    let s = &labeled.series;
    let mut columns = vec![
        Series::new("ts", ts_strings(&s.index)),
        Series::new("poa_wm2", s.poa_wm2.clone()),
        Series::new("tmod_c", s.tmod_c.clone()),
        Series::new("p_ac_kw", s.p_ac_kw.clone()),
        Series::new("e_kwh", s.e_kwh.clone()),
        Series::new(
            "event_label",
            labeled.event_label.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
        ),
    ];

    if let Some(res) = &report.residuals {
        columns.push(Series::new("p_expected_kw", res.p_expected_kw.clone()));
        columns.push(Series::new("residual_kw", res.residual_kw.clone()));
        columns.push(Series::new("resid_z", res.resid_z.clone()));
        columns.push(Series::new("resid_roll_med", res.resid_roll_med.clone()));
        columns.push(Series::new("anomaly_point", res.anomaly_point.clone()));
    }
    if let Some(losses) = &report.losses {
        let rows = &losses.rows;
        columns.push(Series::new("e_exp_kwh", rows.e_exp_kwh.clone()));
        columns.push(Series::new("e_act_kwh", rows.e_act_kwh.clone()));
        columns.push(Series::new("loss_kwh", rows.loss_kwh.clone()));
        for (label, bucket) in EventLabel::CATEGORIES.iter().zip(rows.loss_by_category.iter()) {
            columns.push(Series::new(&format!("loss_{}", label.as_str()), bucket.clone()));
        }
        columns.push(Series::new("loss_unexplained", rows.loss_unexplained.clone()));
    }
    if let Some(kpis) = &report.kpis {
        columns.push(Series::new("energy_kwh", kpis.energy_kwh.clone()));
        columns.push(Series::new("perf_index", kpis.perf_index.clone()));
    }

    Ok(Some(DataFrame::new(columns)?))
}

pub fn walkforward_frame(wf: &WalkForwardReport) -> Result<DataFrame> {
    let w = &wf.windows;
    let df = DataFrame::new(vec![
        Series::new("train_start", w.iter().map(|x| x.train_start.to_rfc3339()).collect::<Vec<_>>()),
        Series::new("train_end", w.iter().map(|x| x.train_end.to_rfc3339()).collect::<Vec<_>>()),
        Series::new("test_end", w.iter().map(|x| x.test_end.to_rfc3339()).collect::<Vec<_>>()),
        Series::new("ok", w.iter().map(|x| x.ok).collect::<Vec<_>>()),
        Series::new("reason", w.iter().map(|x| x.reason.clone()).collect::<Vec<_>>()),
        Series::new("mae_kw", w.iter().map(|x| x.mae_kw).collect::<Vec<_>>()),
        Series::new("rmse_kw", w.iter().map(|x| x.rmse_kw).collect::<Vec<_>>()),
        Series::new("n", w.iter().map(|x| x.n as u64).collect::<Vec<_>>()),
    ])?;
    Ok(df)
}

pub fn losses_daily_frame(daily: &[DailyLoss]) -> Result<DataFrame> {
    let col = |f: fn(&DailyLoss) -> f64| -> Vec<f64> { daily.iter().map(f).collect() };
    let df = DataFrame::new(vec![
        Series::new("date", daily.iter().map(|d| d.date.to_string()).collect::<Vec<_>>()),
        Series::new("loss_kwh", col(|d| d.loss_kwh)),
        Series::new("loss_unexplained", col(|d| d.loss_unexplained)),
        Series::new("loss_curtailment", col(|d| d.loss_curtailment)),
        Series::new("loss_grid_outage", col(|d| d.loss_grid_outage)),
        Series::new("loss_planned_maintenance", col(|d| d.loss_planned_maintenance)),
        Series::new("loss_inverter_fault", col(|d| d.loss_inverter_fault)),
        Series::new("loss_comms_data", col(|d| d.loss_comms_data)),
        Series::new("loss_other_unknown", col(|d| d.loss_other_unknown)),
        Series::new("loss_labelled", col(|d| d.loss_labelled)),
        Series::new("loss_unlabelled", col(|d| d.loss_unlabelled)),
    ])?;
    Ok(df)
}

pub fn kpi_daily_frame(daily: &[DailyKpi]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new("date", daily.iter().map(|d| d.date.to_string()).collect::<Vec<_>>()),
        Series::new("energy_kwh", daily.iter().map(|d| d.energy_kwh).collect::<Vec<_>>()),
        Series::new(
            "energy_kwh_intrinsic",
            daily.iter().map(|d| d.energy_kwh_intrinsic).collect::<Vec<_>>(),
        ),
        Series::new(
            "specific_yield_kwh_per_kwp",
            daily.iter().map(|d| d.specific_yield_kwh_per_kwp).collect::<Vec<_>>(),
        ),
        Series::new(
            "perf_index_median",
            daily.iter().map(|d| d.perf_index_median).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

pub fn kpi_monthly_frame(monthly: &[MonthlyKpi]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(
            "month",
            monthly.iter().map(|m| m.month.format("%Y-%m").to_string()).collect::<Vec<_>>(),
        ),
        Series::new("energy_kwh", monthly.iter().map(|m| m.energy_kwh).collect::<Vec<_>>()),
        Series::new(
            "energy_kwh_intrinsic",
            monthly.iter().map(|m| m.energy_kwh_intrinsic).collect::<Vec<_>>(),
        ),
        Series::new(
            "perf_index_median",
            monthly.iter().map(|m| m.perf_index_median).collect::<Vec<_>>(),
        ),
        Series::new(
            "specific_yield_kwh_per_kwp",
            monthly.iter().map(|m| m.specific_yield_kwh_per_kwp).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

/// One row per plant: outcome, chosen power level and headline numbers.
pub fn summary_frame(reports: &[PlantReport]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new("plant_name", reports.iter().map(|r| r.plant_name.as_str()).collect::<Vec<_>>()),
        Series::new("ok", reports.iter().map(|r| r.ok).collect::<Vec<_>>()),
        Series::new("reason", reports.iter().map(|r| r.reason.clone()).collect::<Vec<_>>()),
        Series::new(
            "power_level",
            reports
                .iter()
                .map(|r| r.power_level.level.map(|l| l.to_string()))
                .collect::<Vec<_>>(),
        ),
        Series::new(
            "power_level_reason",
            reports.iter().map(|r| r.power_level.reason.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            "n_train",
            reports
                .iter()
                .map(|r| r.model.as_ref().map(|m| m.n_train as u64))
                .collect::<Vec<_>>(),
        ),
        Series::new(
            "anomaly_points",
            reports.iter().map(|r| r.anomaly_count() as u64).collect::<Vec<_>>(),
        ),
        Series::new(
            "total_loss_kwh",
            reports
                .iter()
                .map(|r| r.losses.as_ref().map(|l| l.total_loss_kwh()))
                .collect::<Vec<_>>(),
        ),
        Series::new("dq_score", reports.iter().map(|r| r.dq.dq_score).collect::<Vec<_>>()),
        Series::new(
            "monitoring_confidence",
            reports.iter().map(|r| r.dq.monitoring_confidence.to_string()).collect::<Vec<_>>(),
        ),
        Series::new(
            "issues",
            reports
                .iter()
                .map(|r| r.issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "))
                .collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

/// Write every fleet-level and per-plant table; returns the number of files written.
pub fn write_all(
    writer: &OutputWriter,
    catalog: &[SignalCatalogEntry],
    audit: &[TimeIndexAudit],
    resampled: &ResampledTable,
    reports: &[PlantReport],
) -> Result<usize> {
    let mut files = 0;
    files += writer.write("signal_catalog", &mut catalog_frame(catalog)?)?.len();
    files += writer.write("time_index_audit", &mut audit_frame(audit)?)?.len();
    files += writer.write("scada_resampled", &mut resampled_frame(resampled)?)?.len();

    let dq: Vec<DqReport> = reports.iter().map(|r| r.dq.clone()).collect();
    files += writer.write("dq_report", &mut dq_frame(&dq)?)?.len();

    for report in reports {
        let plant = &report.plant_name;
        if let Some(mut df) = timeseries_frame(report)? {
            files += writer.write(&format!("{}_timeseries", plant), &mut df)?.len();
        }
        if let Some(wf) = &report.walkforward {
            files += writer
                .write(&format!("{}_walkforward", plant), &mut walkforward_frame(wf)?)?
                .len();
        }
        if let Some(losses) = &report.losses {
            files += writer
                .write(&format!("{}_losses_daily", plant), &mut losses_daily_frame(&losses.daily)?)?
                .len();
        }
        if let Some(kpis) = &report.kpis {
            files += writer
                .write(&format!("{}_kpi_daily", plant), &mut kpi_daily_frame(&kpis.daily)?)?
                .len();
            files += writer
                .write(&format!("{}_kpi_monthly", plant), &mut kpi_monthly_frame(&kpis.monthly)?)?
                .len();
        }
    }

    files += writer.write("plant_summary", &mut summary_frame(reports)?)?.len();
    Ok(files)
}

/// Per-plant entry of the run manifest.
#[derive(Debug, Serialize)]
pub struct PlantManifest<'a> {
    pub plant_name: &'a str,
    pub ok: bool,
    pub reason: Option<&'a str>,
    pub power_level_reason: &'a str,
    pub dq: &'a DqReport,
    pub walkforward: Option<&'a WalkForwardReport>,
}

/// JSON record of one run: inputs, settings and per-plant outcome.
#[derive(Debug, Serialize)]
pub struct RunManifest<'a> {
    pub generated_at: String,
    pub timezone: String,
    pub standard_freq_minutes: i64,
    pub scada_files: Vec<String>,
    pub plants: Vec<PlantManifest<'a>>,
}

impl<'a> RunManifest<'a> {
    pub fn new(
        cfg: &pv_health::PipelineConfig,
        scada_files: &[PathBuf],
        reports: &'a [PlantReport],
    ) -> Self {
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            timezone: cfg.timezone.name().to_string(),
            standard_freq_minutes: cfg.standard_freq.num_minutes(),
            scada_files: scada_files.iter().map(|p| p.display().to_string()).collect(),
            plants: reports
                .iter()
                .map(|r| PlantManifest {
                    plant_name: &r.plant_name,
                    ok: r.ok,
                    reason: r.reason.as_deref(),
                    power_level_reason: &r.power_level.reason,
                    dq: &r.dq,
                    walkforward: r.walkforward.as_ref(),
                })
                .collect(),
        }
    }
}

impl OutputWriter {
    pub fn write_manifest(&self, manifest: &RunManifest<'_>) -> Result<PathBuf> {
        let path = self.dir.join("run_manifest.json");
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), manifest)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pv_health::kpi::DailyKpi;

    fn daily_losses() -> Vec<DailyLoss> {
        (1..=3)
            .map(|d| DailyLoss {
                date: NaiveDate::from_ymd_opt(2024, 6, d).unwrap(),
                loss_kwh: 10.0 * d as f64,
                loss_unexplained: 4.0,
                loss_curtailment: 6.0,
                loss_grid_outage: 0.0,
                loss_planned_maintenance: 0.0,
                loss_inverter_fault: 0.0,
                loss_comms_data: 0.0,
                loss_other_unknown: 0.0,
                loss_labelled: 6.0,
                loss_unlabelled: 10.0 * d as f64 - 6.0,
            })
            .collect()
    }

    #[test]
    fn test_file_stem_sanitizes_plant_names() {
        assert_eq!(file_stem("Plant A/B"), "Plant_A_B");
        assert_eq!(file_stem("delta-2_timeseries"), "delta-2_timeseries");
    }

    #[test]
    fn test_losses_daily_frame_shape() {
        let df = losses_daily_frame(&daily_losses()).unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(df.width(), 11);
        let dates = df.column("date").unwrap().utf8().unwrap();
        assert_eq!(dates.get(0), Some("2024-06-01"));
    }

    #[test]
    fn test_kpi_daily_frame_keeps_nulls() {
        let daily = vec![DailyKpi {
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            energy_kwh: Some(12.0),
            energy_kwh_intrinsic: None,
            specific_yield_kwh_per_kwp: None,
            perf_index_median: Some(1.0),
        }];
        let df = kpi_daily_frame(&daily).unwrap();
        assert_eq!(df.column("energy_kwh_intrinsic").unwrap().null_count(), 1);
        assert_eq!(df.column("energy_kwh").unwrap().null_count(), 0);
    }

    #[test]
    fn test_writer_formats() {
        let dir = tempfile::tempdir().unwrap();
        let both = OutputWriter::new(dir.path(), OutputFormat::Both).unwrap();
        let written = both
            .write("Plant 1_losses_daily", &mut losses_daily_frame(&daily_losses()).unwrap())
            .unwrap();
        assert_eq!(written.len(), 2);
        assert!(dir.path().join("Plant_1_losses_daily.csv").exists());
        assert!(dir.path().join("Plant_1_losses_daily.parquet").exists());

        let csv_text = fs::read_to_string(dir.path().join("Plant_1_losses_daily.csv")).unwrap();
        assert!(csv_text.starts_with("date,loss_kwh,loss_unexplained"));
        assert_eq!(csv_text.lines().count(), 4);

        let csv_only = OutputWriter::new(&dir.path().join("csv"), OutputFormat::Csv).unwrap();
        let written = csv_only
            .write("summary", &mut losses_daily_frame(&daily_losses()).unwrap())
            .unwrap();
        assert_eq!(written.len(), 1);
        assert!(!dir.path().join("csv").join("summary.parquet").exists());
    }

    #[test]
    fn test_manifest_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(dir.path(), OutputFormat::Csv).unwrap();
        let cfg = pv_health::PipelineConfig::default();
        let manifest = RunManifest::new(&cfg, &[PathBuf::from("scada_a.csv")], &[]);
        let path = writer.write_manifest(&manifest).unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["timezone"], "Europe/Athens");
        assert_eq!(value["standard_freq_minutes"], 5);
        assert_eq!(value["scada_files"][0], "scada_a.csv");
        assert!(value["plants"].as_array().unwrap().is_empty());
    }
}
