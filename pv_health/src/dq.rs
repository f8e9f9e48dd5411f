use crate::config::PipelineConfig;
use crate::models::{ResampledTable, SignalSeries};
use crate::plant::{POA_SIGNAL, POWER_SIGNAL, TMOD_SIGNAL};
use crate::stats::sample_std;
use crate::timegrid::Timestamp;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

const PF_SIGNAL: &str = "pf";
const STUCK_WINDOW: usize = 12;
const STUCK_TOLERANCE: f64 = 1e-6;
/// Score given to a component whose fraction cannot be computed
const UNKNOWN_SCORE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitoringConfidence {
    High,
    Medium,
    Low,
}

impl MonitoringConfidence {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            MonitoringConfidence::High
        } else if score >= 0.70 {
            MonitoringConfidence::Medium
        } else {
            MonitoringConfidence::Low
        }
    }
}

impl fmt::Display for MonitoringConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitoringConfidence::High => "High",
            MonitoringConfidence::Medium => "Medium",
            MonitoringConfidence::Low => "Low",
        };
        f.write_str(s)
    }
}

/// Data-quality fractions and scores of one plant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DqReport {
    pub plant_name: String,
    pub poa_missing_frac_day: Option<f64>,
    pub tmod_missing_frac_day: Option<f64>,
    pub p_missing_frac_day: Option<f64>,
    pub poa_oob_frac: Option<f64>,
    pub tmod_oob_frac: Option<f64>,
    pub pf_oob_frac: Option<f64>,
    pub poa_stuck_frac: Option<f64>,
    pub tmod_stuck_frac: Option<f64>,
    pub counter_reset_frac: Option<f64>,
    pub completeness_score: f64,
    pub plausibility_score: f64,
    pub stuck_score: f64,
    pub counter_score: f64,
    pub dq_score: f64,
    pub monitoring_confidence: MonitoringConfidence,
}

fn fraction(flags: impl Iterator<Item = bool>) -> Option<f64> {
    let (hits, total) = flags.fold((0usize, 0usize), |(h, t), f| (h + f as usize, t + 1));
    (total > 0).then(|| hits as f64 / total as f64)
}

fn frac_to_score(x: Option<f64>) -> f64 {
    match x {
        Some(x) if x.is_finite() => (1.0 - (x * 5.0).min(1.0)).max(0.0),
        _ => UNKNOWN_SCORE,
    }
}

fn average(scores: &[f64]) -> f64 {
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Share of rolling 12-point windows whose sample std is flat; needs at least two windows of data.
pub fn stuck_sensor_fraction(series: &SignalSeries) -> Option<f64> {
    let values: Vec<f64> = series.values().flatten().copied().collect();
    if values.len() < STUCK_WINDOW * 2 {
        return None;
    }
    fraction((0..values.len()).map(|i| {
        i + 1 >= STUCK_WINDOW
            && sample_std(&values[i + 1 - STUCK_WINDOW..=i]).map_or(false, |sd| sd <= STUCK_TOLERANCE)
    }))
}

fn value_at(series: &SignalSeries, ts: &Timestamp) -> Option<f64> {
    series.get(ts).copied().flatten()
}

/// Score one plant's monitoring data from the resampled table.
pub fn dq_score_plant(rs: &ResampledTable, cfg: &PipelineConfig, plant: &str) -> DqReport {
    let poa = ResampledTable::median_by_ts(rs.select(plant, None, |s| s == POA_SIGNAL));
    let tmod = ResampledTable::median_by_ts(rs.select(plant, None, |s| s == TMOD_SIGNAL));
    let power = ResampledTable::sum_by_ts(rs.select(plant, None, |s| s == POWER_SIGNAL));
    let pf = ResampledTable::median_by_ts(rs.select(plant, None, |s| s == PF_SIGNAL));

    let index: BTreeSet<Timestamp> = [&poa, &tmod, &power, &pf]
        .iter()
        .flat_map(|s| s.keys().copied())
        .collect();

    let mut daylight: Vec<&Timestamp> = index
        .iter()
        .filter(|ts| value_at(&poa, ts).map_or(false, |v| v >= cfg.daylight_poa_threshold_wm2))
        .collect();
    if daylight.is_empty() {
        daylight = index.iter().filter(|ts| value_at(&poa, ts).is_some()).collect();
    }
    let missing = |s: &SignalSeries| fraction(daylight.iter().map(|ts| value_at(s, ts).is_none()));
    let out_of_bounds = |s: &SignalSeries, lo: f64, hi: f64| {
        fraction(index.iter().map(|ts| value_at(s, ts).map_or(false, |v| v < lo || v > hi)))
    };

    let poa_missing_frac_day = missing(&poa);
    let tmod_missing_frac_day = missing(&tmod);
    let p_missing_frac_day = missing(&power);

    let poa_oob_frac = out_of_bounds(&poa, cfg.min_valid_poa_wm2, cfg.max_valid_poa_wm2);
    let tmod_oob_frac = out_of_bounds(&tmod, cfg.min_valid_tmod_c, cfg.max_valid_tmod_c);
    let pf_oob_frac = if pf.values().any(Option::is_some) {
        fraction(index.iter().map(|ts| value_at(&pf, ts).map_or(false, |v| v.abs() > cfg.max_pf_abs)))
    } else {
        None
    };

    let poa_stuck_frac = stuck_sensor_fraction(&poa);
    let tmod_stuck_frac = stuck_sensor_fraction(&tmod);

    // counter resets on the plant-summed counters
    let counters = ResampledTable::sum_by_ts(rs.select(plant, None, |s| s.starts_with("energy_kwh_counter")));
    let counter_values: Vec<f64> = counters.values().flatten().copied().collect();
    let counter_reset_frac = fraction((0..counter_values.len()).map(|i| {
        i > 0 && counter_values[i] - counter_values[i - 1] < cfg.counter_reset_negative_kwh_threshold
    }));

    let completeness_score = average(&[
        frac_to_score(poa_missing_frac_day),
        frac_to_score(tmod_missing_frac_day),
        frac_to_score(p_missing_frac_day),
    ]);
    let plausibility_score = average(&[
        frac_to_score(poa_oob_frac),
        frac_to_score(tmod_oob_frac),
        frac_to_score(pf_oob_frac),
    ]);
    let stuck_score = average(&[frac_to_score(poa_stuck_frac), frac_to_score(tmod_stuck_frac)]);
    let counter_score = frac_to_score(counter_reset_frac);
    let dq_score = average(&[completeness_score, plausibility_score, stuck_score, counter_score]);

    DqReport {
        plant_name: plant.to_string(),
        poa_missing_frac_day,
        tmod_missing_frac_day,
        p_missing_frac_day,
        poa_oob_frac,
        tmod_oob_frac,
        pf_oob_frac,
        poa_stuck_frac,
        tmod_stuck_frac,
        counter_reset_frac,
        completeness_score,
        plausibility_score,
        stuck_score,
        counter_score,
        dq_score,
        monitoring_confidence: MonitoringConfidence::from_score(dq_score),
    }
}

/// One report per named plant, sorted by plant name.
pub fn dq_report_fleet(rs: &ResampledTable, cfg: &PipelineConfig) -> Vec<DqReport> {
    rs.plant_names()
        .iter()
        .map(|plant| dq_score_plant(rs, cfg, plant))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComponentType, ResampledRecord, SeriesKey, SignalType};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};
    use chrono_tz::UTC;
    use std::sync::Arc;

    fn push(rs: &mut ResampledTable, plant: &str, id: &str, signal: &str, values: &[Option<f64>]) {
        let t0 = UTC.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let key = Arc::new(SeriesKey {
            plant_name: Some(plant.to_string()),
            component_type: ComponentType::Array,
            component_id: id.to_string(),
            canonical_signal: signal.to_string(),
            unit: None,
        });
        for (i, v) in values.iter().enumerate() {
            rs.records.push(ResampledRecord {
                ts: t0 + Duration::minutes(5 * i as i64),
                key: Arc::clone(&key),
                signal_type: SignalType::from_canonical(signal),
                value_rs: *v,
            });
        }
    }

    fn varying(n: usize, base: f64) -> Vec<Option<f64>> {
        (0..n).map(|i| Some(base + (i % 5) as f64)).collect()
    }

    #[test]
    fn test_clean_plant_scores_high() {
        let mut rs = ResampledTable::default();
        push(&mut rs, "P1", "1", POA_SIGNAL, &varying(48, 600.0));
        push(&mut rs, "P1", "1", TMOD_SIGNAL, &varying(48, 35.0));
        push(&mut rs, "P1", "1", POWER_SIGNAL, &varying(48, 300.0));
        push(&mut rs, "P1", "1", PF_SIGNAL, &vec![Some(0.99); 48]);
        let counter: Vec<Option<f64>> = (0..48).map(|i| Some(1000.0 + i as f64)).collect();
        push(&mut rs, "P1", "1", "energy_kwh_counter", &counter);

        let report = dq_score_plant(&rs, &PipelineConfig::default(), "P1");
        assert_eq!(report.p_missing_frac_day, Some(0.0));
        assert_eq!(report.poa_oob_frac, Some(0.0));
        assert_eq!(report.poa_stuck_frac, Some(0.0));
        assert_eq!(report.counter_reset_frac, Some(0.0));
        assert_relative_eq!(report.dq_score, 1.0);
        assert_eq!(report.monitoring_confidence, MonitoringConfidence::High);
    }

    #[test]
    fn test_stuck_and_missing_components() {
        let mut rs = ResampledTable::default();
        push(&mut rs, "P1", "1", POA_SIGNAL, &varying(40, 600.0));
        push(&mut rs, "P1", "1", TMOD_SIGNAL, &vec![Some(30.0); 40]);
        let mut power = varying(40, 300.0);
        for v in power.iter_mut().take(10) {
            *v = None;
        }
        push(&mut rs, "P1", "1", POWER_SIGNAL, &power);

        let report = dq_score_plant(&rs, &PipelineConfig::default(), "P1");
        assert_relative_eq!(report.p_missing_frac_day.unwrap(), 0.25);
        // 29 of 40 positions close a flat 12-point window
        assert_relative_eq!(report.tmod_stuck_frac.unwrap(), 29.0 / 40.0);
        assert_eq!(report.pf_oob_frac, None);
        assert_eq!(report.counter_reset_frac, None);
        assert_relative_eq!(report.counter_score, 0.7);
        // 1 - min(1, 5 * 0.25)
        assert_relative_eq!(report.completeness_score, (1.0 + 1.0 + 0.0) / 3.0);
        assert_eq!(report.monitoring_confidence, MonitoringConfidence::Low);
    }

    #[test]
    fn test_fleet_report_sorted() {
        let mut rs = ResampledTable::default();
        push(&mut rs, "Zeta", "1", POA_SIGNAL, &varying(5, 600.0));
        push(&mut rs, "Alpha", "1", POA_SIGNAL, &varying(5, 600.0));
        let reports = dq_report_fleet(&rs, &PipelineConfig::default());
        let names: Vec<_> = reports.iter().map(|r| r.plant_name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Zeta"]);
    }
}
