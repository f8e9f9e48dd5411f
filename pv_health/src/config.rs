use crate::timegrid::{parse_freq, steps_in};
use anyhow::{bail, Context, Result};
use chrono::Duration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Longest accepted walk-forward, rolling or interpolation span.
pub const MAX_WINDOW_DAYS: i64 = 36_525;

/// How per-category loss buckets treat over-performance against the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossSignPolicy {
    /// Buckets keep the signed loss; over-performance is a negative loss.
    #[default]
    Signed,
    /// Buckets only accumulate positive losses.
    PositiveOnly,
}

/// Run configuration. Built once, validated, then passed by reference to every stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // I/O
    pub scada_path: Option<PathBuf>,
    pub events_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub timestamp_col: String,
    pub timestamp_format: Option<String>,

    // Time
    pub timezone: Tz,
    pub standard_freq: Duration,

    // Daylight & plausibility
    pub daylight_poa_threshold_wm2: f64,
    pub poa_for_kpi_min_wm2: f64,
    pub min_valid_poa_wm2: f64,
    pub max_valid_poa_wm2: f64,
    pub min_valid_tmod_c: f64,
    pub max_valid_tmod_c: f64,
    pub max_pf_abs: f64,

    // Missing data policy
    pub max_interp_gap_minutes: i64,
    pub allow_interp_signals: BTreeSet<String>,
    pub allow_ffill_signals: BTreeSet<String>,

    // Counters
    pub counter_reset_negative_kwh_threshold: f64,

    // Irradiance QC, consumed outside the core
    pub clearsky_qc_quantile: f64,

    // Modeling
    pub model_min_points: usize,
    pub model_max_train_points: Option<usize>,
    pub walkforward_train_days: i64,
    pub walkforward_test_days: i64,

    // Anomalies & losses
    pub residual_z_threshold: f64,
    pub rolling_window_days: i64,
    pub loss_sign_policy: LossSignPolicy,

    pub selected_plant: Option<String>,
    pub random_seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scada_path: None,
            events_path: None,
            metadata_path: None,
            timestamp_col: "Timestamp".to_string(),
            timestamp_format: None,
            timezone: chrono_tz::Europe::Athens,
            standard_freq: Duration::minutes(5),
            daylight_poa_threshold_wm2: 50.0,
            poa_for_kpi_min_wm2: 200.0,
            min_valid_poa_wm2: 0.0,
            max_valid_poa_wm2: 1400.0,
            min_valid_tmod_c: -20.0,
            max_valid_tmod_c: 90.0,
            max_pf_abs: 1.2,
            max_interp_gap_minutes: 15,
            allow_interp_signals: ["poa_irradiance_wm2", "tmod_c", "tamb_c"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_ffill_signals: BTreeSet::new(),
            counter_reset_negative_kwh_threshold: -0.01,
            clearsky_qc_quantile: 0.98,
            model_min_points: 2000,
            model_max_train_points: None,
            walkforward_train_days: 60,
            walkforward_test_days: 14,
            residual_z_threshold: 4.0,
            rolling_window_days: 7,
            loss_sign_policy: LossSignPolicy::Signed,
            selected_plant: None,
            random_seed: 42,
        }
    }
}

/// On-disk form of the configuration; absent keys keep their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub scada_path: Option<String>,
    pub events_path: Option<String>,
    pub metadata_path: Option<String>,
    pub timestamp_col: Option<String>,
    pub timestamp_format: Option<String>,
    pub default_timezone: Option<String>,
    pub standard_freq: Option<String>,
    pub daylight_poa_threshold_wm2: Option<f64>,
    pub poa_for_kpi_min_wm2: Option<f64>,
    pub min_valid_poa_wm2: Option<f64>,
    pub max_valid_poa_wm2: Option<f64>,
    pub min_valid_tmod_c: Option<f64>,
    pub max_valid_tmod_c: Option<f64>,
    pub max_pf_abs: Option<f64>,
    pub max_interp_gap_minutes: Option<i64>,
    pub allow_interp_signals: Option<Vec<String>>,
    pub allow_ffill_signals: Option<Vec<String>>,
    pub counter_reset_negative_kwh_threshold: Option<f64>,
    pub clearsky_qc_quantile: Option<f64>,
    pub model_min_points: Option<usize>,
    pub model_max_train_points: Option<usize>,
    pub walkforward_train_days: Option<i64>,
    pub walkforward_test_days: Option<i64>,
    pub residual_z_threshold: Option<f64>,
    pub rolling_window_days: Option<i64>,
    pub loss_sign_policy: Option<LossSignPolicy>,
    pub selected_plant: Option<String>,
    pub random_seed: Option<u64>,
}

impl PipelineConfig {
    /// Load a JSON configuration file. Relative paths resolve against the file's directory.
    pub fn load_json(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Self::from_file(file, path.parent())
    }

    /// Apply a parsed config file on top of the defaults and validate the result.
    pub fn from_file(file: ConfigFile, base_dir: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let resolve = |p: Option<String>| -> Result<Option<PathBuf>> {
            match p {
                None => Ok(None),
                Some(s) if s.trim().is_empty() => bail!("configured paths must not be empty"),
                Some(s) => {
                    let path = PathBuf::from(s);
                    Ok(Some(match base_dir {
                        Some(dir) if path.is_relative() => dir.join(path),
                        _ => path,
                    }))
                }
            }
        };

        let timezone = match file.default_timezone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| anyhow::anyhow!("unknown timezone '{}': {}", name, e))?,
            None => defaults.timezone,
        };
        let standard_freq = match file.standard_freq {
            Some(rule) => parse_freq(&rule)?,
            None => defaults.standard_freq,
        };

        let cfg = Self {
            scada_path: resolve(file.scada_path)?,
            events_path: resolve(file.events_path)?,
            metadata_path: resolve(file.metadata_path)?,
            timestamp_col: file.timestamp_col.unwrap_or(defaults.timestamp_col),
            timestamp_format: file.timestamp_format.or(defaults.timestamp_format),
            timezone,
            standard_freq,
            daylight_poa_threshold_wm2: file
                .daylight_poa_threshold_wm2
                .unwrap_or(defaults.daylight_poa_threshold_wm2),
            poa_for_kpi_min_wm2: file.poa_for_kpi_min_wm2.unwrap_or(defaults.poa_for_kpi_min_wm2),
            min_valid_poa_wm2: file.min_valid_poa_wm2.unwrap_or(defaults.min_valid_poa_wm2),
            max_valid_poa_wm2: file.max_valid_poa_wm2.unwrap_or(defaults.max_valid_poa_wm2),
            min_valid_tmod_c: file.min_valid_tmod_c.unwrap_or(defaults.min_valid_tmod_c),
            max_valid_tmod_c: file.max_valid_tmod_c.unwrap_or(defaults.max_valid_tmod_c),
            max_pf_abs: file.max_pf_abs.unwrap_or(defaults.max_pf_abs),
            max_interp_gap_minutes: file
                .max_interp_gap_minutes
                .unwrap_or(defaults.max_interp_gap_minutes),
            allow_interp_signals: file
                .allow_interp_signals
                .map(|v| v.into_iter().collect())
                .unwrap_or(defaults.allow_interp_signals),
            allow_ffill_signals: file
                .allow_ffill_signals
                .map(|v| v.into_iter().collect())
                .unwrap_or(defaults.allow_ffill_signals),
            counter_reset_negative_kwh_threshold: file
                .counter_reset_negative_kwh_threshold
                .unwrap_or(defaults.counter_reset_negative_kwh_threshold),
            clearsky_qc_quantile: file.clearsky_qc_quantile.unwrap_or(defaults.clearsky_qc_quantile),
            model_min_points: file.model_min_points.unwrap_or(defaults.model_min_points),
            model_max_train_points: file.model_max_train_points.or(defaults.model_max_train_points),
            walkforward_train_days: file
                .walkforward_train_days
                .unwrap_or(defaults.walkforward_train_days),
            walkforward_test_days: file
                .walkforward_test_days
                .unwrap_or(defaults.walkforward_test_days),
            residual_z_threshold: file.residual_z_threshold.unwrap_or(defaults.residual_z_threshold),
            rolling_window_days: file.rolling_window_days.unwrap_or(defaults.rolling_window_days),
            loss_sign_policy: file.loss_sign_policy.unwrap_or(defaults.loss_sign_policy),
            selected_plant: file.selected_plant.or(defaults.selected_plant),
            random_seed: file.random_seed.unwrap_or(defaults.random_seed),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timestamp_col.trim().is_empty() {
            bail!("timestamp_col must not be empty");
        }
        if self.standard_freq <= Duration::zero() {
            bail!("standard_freq must be positive");
        }
        if Duration::days(1).num_seconds() % self.standard_freq.num_seconds().max(1) != 0 {
            bail!("standard_freq must divide one day evenly");
        }
        if self.min_valid_poa_wm2 >= self.max_valid_poa_wm2 {
            bail!("min_valid_poa_wm2 must be below max_valid_poa_wm2");
        }
        if self.min_valid_tmod_c >= self.max_valid_tmod_c {
            bail!("min_valid_tmod_c must be below max_valid_tmod_c");
        }
        if self.max_interp_gap_minutes < 0 {
            bail!("max_interp_gap_minutes must not be negative");
        }
        if self.model_min_points == 0 {
            bail!("model_min_points must be positive");
        }
        if matches!(self.model_max_train_points, Some(0)) {
            bail!("model_max_train_points must be positive when set");
        }
        if self.walkforward_train_days <= 0 || self.walkforward_test_days <= 0 {
            bail!("walk-forward window lengths must be positive");
        }
        if self.rolling_window_days <= 0 {
            bail!("rolling_window_days must be positive");
        }
        if self.walkforward_train_days.saturating_add(self.walkforward_test_days) > MAX_WINDOW_DAYS
            || self.rolling_window_days > MAX_WINDOW_DAYS
        {
            bail!("window lengths must not exceed {} days", MAX_WINDOW_DAYS);
        }
        if self.max_interp_gap_minutes > MAX_WINDOW_DAYS * 24 * 60 {
            bail!("max_interp_gap_minutes must not exceed {} days", MAX_WINDOW_DAYS);
        }
        if !(0.0..=1.0).contains(&self.clearsky_qc_quantile) {
            bail!("clearsky_qc_quantile must lie in [0, 1]");
        }
        if !self.residual_z_threshold.is_finite() || self.residual_z_threshold <= 0.0 {
            bail!("residual_z_threshold must be a positive number");
        }
        for path in [&self.scada_path, &self.events_path, &self.metadata_path]
            .into_iter()
            .flatten()
        {
            if path.as_os_str().is_empty() {
                bail!("configured paths must not be empty");
            }
        }
        Ok(())
    }

    /// Length of one grid interval in hours.
    pub fn interval_hours(&self) -> f64 {
        self.standard_freq.num_seconds() as f64 / 3600.0
    }

    /// Interpolation gap cap expressed in grid points.
    pub fn max_interp_gap_points(&self) -> usize {
        let span = Duration::try_minutes(self.max_interp_gap_minutes).unwrap_or_else(Duration::max_value);
        steps_in(span, self.standard_freq)
    }

    /// Rolling residual window expressed in grid points.
    pub fn rolling_window_points(&self) -> usize {
        let span = Duration::try_days(self.rolling_window_days).unwrap_or_else(Duration::max_value);
        steps_in(span, self.standard_freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_interp_gap_points(), 3);
        assert_eq!(cfg.rolling_window_points(), 2016);
        assert!((cfg.interval_hours() - 5.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn test_from_file_overrides_and_resolves_paths() {
        let file: ConfigFile = serde_json::from_str(
            r#"{
                "scada_path": "data/scada.csv",
                "default_timezone": "UTC",
                "standard_freq": "15min",
                "model_min_points": 500,
                "loss_sign_policy": "positive_only"
            }"#,
        )
        .unwrap();
        let cfg = PipelineConfig::from_file(file, Some(Path::new("/srv/pv"))).unwrap();
        assert_eq!(cfg.scada_path, Some(PathBuf::from("/srv/pv/data/scada.csv")));
        assert_eq!(cfg.timezone, chrono_tz::UTC);
        assert_eq!(cfg.standard_freq, Duration::minutes(15));
        assert_eq!(cfg.model_min_points, 500);
        assert_eq!(cfg.loss_sign_policy, LossSignPolicy::PositiveOnly);
        assert_eq!(cfg.max_interp_gap_points(), 1);
        assert_eq!(cfg.walkforward_train_days, 60);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let bad_tz = ConfigFile {
            default_timezone: Some("Mars/Olympus".to_string()),
            ..Default::default()
        };
        assert!(PipelineConfig::from_file(bad_tz, None).is_err());

        let bad_freq = ConfigFile {
            standard_freq: Some("0min".to_string()),
            ..Default::default()
        };
        assert!(PipelineConfig::from_file(bad_freq, None).is_err());

        let empty_path = ConfigFile {
            events_path: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(PipelineConfig::from_file(empty_path, None).is_err());

        let bad_range = ConfigFile {
            min_valid_tmod_c: Some(100.0),
            ..Default::default()
        };
        assert!(PipelineConfig::from_file(bad_range, None).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_spans() {
        let file: ConfigFile =
            serde_json::from_str(r#"{"standard_freq": "999999999999999min"}"#).unwrap();
        assert!(PipelineConfig::from_file(file, None).is_err());

        let huge_window = ConfigFile {
            walkforward_train_days: Some(i64::MAX),
            walkforward_test_days: Some(i64::MAX),
            ..Default::default()
        };
        assert!(PipelineConfig::from_file(huge_window, None).is_err());

        let huge_rolling = ConfigFile {
            rolling_window_days: Some(999_999_999_999_999),
            ..Default::default()
        };
        assert!(PipelineConfig::from_file(huge_rolling, None).is_err());

        let huge_gap = ConfigFile {
            max_interp_gap_minutes: Some(i64::MAX),
            ..Default::default()
        };
        assert!(PipelineConfig::from_file(huge_gap, None).is_err());

        // unvalidated values still convert without panicking
        let cfg = PipelineConfig {
            rolling_window_days: i64::MAX,
            ..PipelineConfig::default()
        };
        assert!(cfg.rolling_window_points() > 0);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let parsed: Result<ConfigFile, _> = serde_json::from_str(r#"{"standard_frequency": "5min"}"#);
        assert!(parsed.is_err());
    }
}
