use crate::config::PipelineConfig;
use crate::models::LabeledSeries;
use crate::regression::{LinearFit, RobustRegressor};
use crate::timegrid::{local_midnight, Timestamp};
use chrono::Duration;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

pub const FEATURE_NAMES: [&str; 4] = ["poa", "poa2", "tmod", "poa_tmod"];

/// Feature vector: [irradiance, irradiance², temperature, irradiance × temperature].
pub fn build_features(poa_wm2: f64, tmod_c: f64) -> Vec<f64> {
    vec![poa_wm2, poa_wm2 * poa_wm2, tmod_c, poa_wm2 * tmod_c]
}

/// Rows usable for training and scoring: intrinsic, daylight (KPI threshold)
/// and with power, irradiance and temperature all present.
pub fn usable_mask(series: &LabeledSeries, cfg: &PipelineConfig) -> Vec<bool> {
    let s = &series.series;
    (0..series.len())
        .map(|i| {
            series.event_label[i].is_intrinsic()
                && s.poa_wm2[i].map_or(false, |poa| poa >= cfg.poa_for_kpi_min_wm2)
                && s.p_ac_kw[i].is_some()
                && s.tmod_c[i].is_some()
        })
        .collect()
}

/// Expected-power model for one training window. Check `ok` before predicting.
#[derive(Debug, Clone)]
pub struct ExpectedPowerModel {
    pub fit: Option<LinearFit>,
    /// Rows of the training series actually used
    pub train_mask: Vec<bool>,
    pub features: Vec<String>,
    pub ok: bool,
    pub reason: Option<String>,
    pub n_train: usize,
    pub backend: String,
}

impl ExpectedPowerModel {
    fn failed(train_mask: Vec<bool>, n_train: usize, backend: &str, reason: String) -> Self {
        Self {
            fit: None,
            train_mask,
            features: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            ok: false,
            reason: Some(reason),
            n_train,
            backend: backend.to_string(),
        }
    }

    /// Expected power for every row; rows with missing features (or a model that
    /// is not ok) give null.
    pub fn predict(&self, series: &LabeledSeries) -> Vec<Option<f64>> {
        let s = &series.series;
        let Some(fit) = self.fit.as_ref().filter(|_| self.ok) else {
            return vec![None; series.len()];
        };
        (0..series.len())
            .map(|i| match (s.poa_wm2[i], s.tmod_c[i]) {
                (Some(poa), Some(tmod)) => Some(fit.predict_row(&build_features(poa, tmod))),
                _ => None,
            })
            .collect()
    }
}

fn subsample(mask: &mut [bool], keep: usize, seed: u64) {
    let rows: Vec<usize> = (0..mask.len()).filter(|&i| mask[i]).collect();
    if rows.len() <= keep {
        return;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let chosen = rand::seq::index::sample(&mut rng, rows.len(), keep);
    mask.iter_mut().for_each(|m| *m = false);
    for idx in chosen.into_iter() {
        mask[rows[idx]] = true;
    }
}

/// Fit the expected-power model on the usable rows of `series`.
pub fn fit_expected_power_model(
    series: &LabeledSeries,
    cfg: &PipelineConfig,
    regressor: &dyn RobustRegressor,
) -> ExpectedPowerModel {
    let mut mask = usable_mask(series, cfg);
    let n_usable = mask.iter().filter(|&&m| m).count();
    if n_usable < cfg.model_min_points {
        return ExpectedPowerModel::failed(
            mask,
            n_usable,
            regressor.name(),
            format!("Not enough points: {}", n_usable),
        );
    }

    if let Some(max_points) = cfg.model_max_train_points {
        subsample(&mut mask, max_points, cfg.random_seed);
    }

    let s = &series.series;
    let mut features = Vec::new();
    let mut target = Vec::new();
    for i in (0..series.len()).filter(|&i| mask[i]) {
        if let (Some(poa), Some(tmod), Some(p)) = (s.poa_wm2[i], s.tmod_c[i], s.p_ac_kw[i]) {
            features.push(build_features(poa, tmod));
            target.push(p);
        }
    }
    let n_train = target.len();

    match regressor.fit(&features, &target) {
        Ok(fit) => ExpectedPowerModel {
            fit: Some(fit),
            train_mask: mask,
            features: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            ok: true,
            reason: None,
            n_train,
            backend: regressor.name().to_string(),
        },
        Err(issue) => ExpectedPowerModel::failed(mask, n_train, regressor.name(), issue.to_string()),
    }
}

/// One walk-forward train/test window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalkForwardWindow {
    #[serde(serialize_with = "serialize_ts")]
    pub train_start: Timestamp,
    #[serde(serialize_with = "serialize_ts")]
    pub train_end: Timestamp,
    #[serde(serialize_with = "serialize_ts")]
    pub test_end: Timestamp,
    pub ok: bool,
    pub reason: Option<String>,
    pub mae_kw: Option<f64>,
    pub rmse_kw: Option<f64>,
    pub n: usize,
}

fn serialize_ts<S: serde::Serializer>(ts: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalkForwardReport {
    pub ok: bool,
    pub reason: Option<String>,
    pub windows: Vec<WalkForwardWindow>,
}

/// Rolling walk-forward validation: fit on `train_days`, score on the following
/// `test_days`, then advance the window start by `train_days`.
pub fn validate_walkforward(
    series: &LabeledSeries,
    cfg: &PipelineConfig,
    regressor: &dyn RobustRegressor,
) -> WalkForwardReport {
    let usable = usable_mask(series, cfg);
    let n_usable = usable.iter().filter(|&&u| u).count();
    let (Some(first), Some(last)) = (series.series.index.first(), series.series.index.last()) else {
        return WalkForwardReport {
            ok: false,
            reason: Some("empty series".to_string()),
            windows: Vec::new(),
        };
    };
    if n_usable < cfg.model_min_points {
        return WalkForwardReport {
            ok: false,
            reason: Some("insufficient usable points".to_string()),
            windows: Vec::new(),
        };
    }

    let start = local_midnight(*first);
    let end = local_midnight(*last);
    let (Some(train_len), Some(test_len)) = (
        Duration::try_days(cfg.walkforward_train_days),
        Duration::try_days(cfg.walkforward_test_days),
    ) else {
        return WalkForwardReport {
            ok: false,
            reason: Some("walk-forward window out of range".to_string()),
            windows: Vec::new(),
        };
    };

    let mut windows = Vec::new();
    let mut cur = start;
    loop {
        let Some(train_end) = cur.checked_add_signed(train_len) else { break };
        let Some(test_end) = train_end.checked_add_signed(test_len) else { break };
        if test_end > end {
            break;
        }
        let train = series.slice_range(cur, train_end);
        let test = series.slice_range(train_end, test_end);

        let model = fit_expected_power_model(&train, cfg, regressor);
        let window = if !model.ok {
            WalkForwardWindow {
                train_start: cur,
                train_end,
                test_end,
                ok: false,
                reason: model.reason.clone(),
                mae_kw: None,
                rmse_kw: None,
                n: 0,
            }
        } else {
            let predicted = model.predict(&test);
            let test_usable = usable_mask(&test, cfg);
            let errors: Vec<f64> = (0..test.len())
                .filter(|&i| test_usable[i])
                .filter_map(|i| Some(test.series.p_ac_kw[i]? - predicted[i]?))
                .collect();

            if errors.is_empty() {
                WalkForwardWindow {
                    train_start: cur,
                    train_end,
                    test_end,
                    ok: false,
                    reason: Some("no usable test points".to_string()),
                    mae_kw: None,
                    rmse_kw: None,
                    n: 0,
                }
            } else {
                let n = errors.len() as f64;
                let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n;
                let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
                log::debug!(
                    "walk-forward {} -> {}: mae {:.3} kW, rmse {:.3} kW over {} points",
                    cur,
                    test_end,
                    mae,
                    rmse,
                    errors.len()
                );
                WalkForwardWindow {
                    train_start: cur,
                    train_end,
                    test_end,
                    ok: true,
                    reason: None,
                    mae_kw: Some(mae),
                    rmse_kw: Some(rmse),
                    n: errors.len(),
                }
            }
        };
        windows.push(window);
        cur = train_end;
    }

    WalkForwardReport {
        ok: true,
        reason: None,
        windows,
    }
}
