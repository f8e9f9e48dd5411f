use crate::config::PipelineConfig;
use crate::models::{LabeledSeries, ResidualTable};
use crate::regression::MAD_TO_SIGMA;
use crate::stats::{mad, median, rolling_median};

/// Rows where residuals are meaningful: intrinsic operation at or above the KPI irradiance threshold.
pub fn in_regime(series: &LabeledSeries, cfg: &PipelineConfig) -> Vec<bool> {
    (0..series.len())
        .map(|i| {
            series.event_label[i].is_intrinsic()
                && series.series.poa_wm2[i].map_or(false, |poa| poa >= cfg.poa_for_kpi_min_wm2)
        })
        .collect()
}

/// Attach expected power, residuals, robust z-scores, the rolling residual
/// median and point anomaly flags to a labeled plant series.
pub fn detect_anomalies(
    labeled: &LabeledSeries,
    cfg: &PipelineConfig,
    p_expected: &[Option<f64>],
) -> ResidualTable {
    let n = labeled.len();
    let regime = in_regime(labeled, cfg);
    let p_expected_kw: Vec<Option<f64>> = (0..n).map(|i| p_expected.get(i).copied().flatten()).collect();

    let residual_kw: Vec<Option<f64>> = (0..n)
        .map(|i| {
            if !regime[i] {
                return None;
            }
            Some(labeled.series.p_ac_kw[i]? - p_expected_kw[i]?)
        })
        .collect();

    let in_regime_residuals: Vec<f64> = residual_kw.iter().flatten().copied().collect();
    let center = median(&in_regime_residuals);
    let denom = mad(&in_regime_residuals)
        .filter(|m| m.is_finite())
        .map(|m| MAD_TO_SIGMA * m + 1e-9);

    let resid_z: Vec<Option<f64>> = match (center, denom) {
        (Some(med), Some(d)) => residual_kw.iter().map(|r| r.map(|r| (r - med) / d)).collect(),
        _ => vec![None; n],
    };

    let window = cfg.rolling_window_points();
    let min_periods = (window / 5).max(10);
    let resid_roll_med = rolling_median(&residual_kw, window, min_periods);

    let anomaly_point: Vec<bool> = (0..n)
        .map(|i| regime[i] && resid_z[i].map_or(false, |z| z.abs() >= cfg.residual_z_threshold))
        .collect();

    let table = ResidualTable {
        labeled: labeled.clone(),
        p_expected_kw,
        residual_kw,
        resid_z,
        resid_roll_med,
        anomaly_point,
    };
    log::info!(
        "{} in-regime residuals, {} point anomalies (|z| >= {})",
        in_regime_residuals.len(),
        table.anomaly_count(),
        cfg.residual_z_threshold
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventLabel, PlantTimeSeries};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};
    use chrono_tz::UTC;

    /// Residuals cycle through -1, 0, +1 so median = 0 and MAD = 1.
    fn residual_fixture(n: usize, outliers: &[(usize, f64)]) -> (LabeledSeries, Vec<Option<f64>>) {
        let t0 = UTC.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut power: Vec<Option<f64>> = (0..n)
            .map(|i| Some(100.0 + (i % 3) as f64 - 1.0))
            .collect();
        for &(i, delta) in outliers {
            power[i] = Some(100.0 + delta);
        }
        let series = PlantTimeSeries {
            index: (0..n).map(|i| t0 + Duration::minutes(5 * i as i64)).collect(),
            poa_wm2: vec![Some(600.0); n],
            tmod_c: vec![Some(30.0); n],
            p_ac_kw: power,
            e_kwh: vec![None; n],
        };
        (LabeledSeries::unlabeled(series), vec![Some(100.0); n])
    }

    #[test]
    fn test_outliers_beyond_threshold_flagged() {
        let cfg = PipelineConfig::default();
        let (labeled, expected) = residual_fixture(99, &[(10, 20.0), (50, -30.0), (70, 0.5)]);
        let out = detect_anomalies(&labeled, &cfg, &expected);

        assert!(out.anomaly_point[10]);
        assert!(out.anomaly_point[50]);
        // within one MAD
        assert!(!out.anomaly_point[70]);
        assert!(!out.anomaly_point[0]);
        assert_eq!(out.anomaly_count(), 2);

        assert_relative_eq!(out.residual_kw[10].unwrap(), 20.0);
        assert_relative_eq!(out.resid_z[10].unwrap(), 20.0 / (1.4826 + 1e-9), epsilon = 1e-9);
        assert!(out.resid_z[50].unwrap() < 0.0);
    }

    #[test]
    fn test_residuals_null_outside_regime() {
        let cfg = PipelineConfig::default();
        let (mut labeled, expected) = residual_fixture(40, &[(3, 50.0), (4, 50.0)]);
        labeled.event_label[3] = EventLabel::Curtailment;
        labeled.series.poa_wm2[4] = Some(120.0);
        labeled.series.p_ac_kw[5] = None;

        let out = detect_anomalies(&labeled, &cfg, &expected);
        assert_eq!(out.residual_kw[3], None);
        assert_eq!(out.residual_kw[4], None);
        assert_eq!(out.residual_kw[5], None);
        assert!(!out.anomaly_point[3]);
        assert!(!out.anomaly_point[4]);
        assert_eq!(out.p_expected_kw[3], Some(100.0));
    }

    #[test]
    fn test_no_regime_rows_gives_null_scores() {
        let cfg = PipelineConfig::default();
        let (mut labeled, expected) = residual_fixture(20, &[]);
        labeled.series.poa_wm2 = vec![Some(10.0); 20];
        let out = detect_anomalies(&labeled, &cfg, &expected);
        assert!(out.resid_z.iter().all(Option::is_none));
        assert!(out.resid_roll_med.iter().all(Option::is_none));
        assert_eq!(out.anomaly_count(), 0);
    }

    #[test]
    fn test_rolling_median_needs_min_periods() {
        let cfg = PipelineConfig {
            rolling_window_days: 1,
            ..PipelineConfig::default()
        };
        // 288 points per day, min periods max(10, 57) = 57
        let (labeled, expected) = residual_fixture(80, &[]);
        let out = detect_anomalies(&labeled, &cfg, &expected);
        assert!(out.resid_roll_med[55].is_none());
        assert!(out.resid_roll_med[56].is_some());
    }
}
