use crate::config::PipelineConfig;
use crate::issues::DataIssue;
use crate::models::{ComponentType, PlantTimeSeries, ResampledTable, SignalSeries};
use crate::timegrid::Timestamp;
use std::collections::BTreeSet;

pub const POA_SIGNAL: &str = "poa_irradiance_wm2";
pub const TMOD_SIGNAL: &str = "tmod_c";
pub const POWER_SIGNAL: &str = "ac_power_kw";
pub const ENERGY_INTERVAL_SIGNAL: &str = "energy_kwh_interval";

/// Counter families in order of preference; only one family feeds the energy series.
const COUNTER_FAMILIES: [&str; 2] = ["energy_kwh_counter", "energy_kwh_counter_measured"];

/// Which component level feeds the plant power series, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerLevelDecision {
    pub level: Option<ComponentType>,
    pub reason: String,
}

/// Plant-level meteorological series: median across every component reporting the signal.
pub fn plant_met_series(rs: &ResampledTable, plant: &str, canonical_signal: &str) -> Option<SignalSeries> {
    let series = ResampledTable::median_by_ts(rs.select(plant, None, |s| s == canonical_signal));
    (!series.is_empty()).then_some(series)
}

/// Linear interpolation over interior gaps of at most `max_gap` points.
/// Longer gaps, and gaps touching either end, stay null.
pub fn interpolate_limited(values: &[Option<f64>], max_gap: usize) -> Vec<Option<f64>> {
    let mut out = values.to_vec();
    if max_gap == 0 {
        return out;
    }

    let mut last_valid: Option<usize> = None;
    for i in 0..values.len() {
        let Some(right) = values[i] else { continue };
        if let Some(l) = last_valid {
            let gap = i - l - 1;
            if gap > 0 && gap <= max_gap {
                if let Some(left) = values[l] {
                    let span = (i - l) as f64;
                    for (k, slot) in out.iter_mut().enumerate().take(i).skip(l + 1) {
                        let frac = (k - l) as f64 / span;
                        *slot = Some(left + (right - left) * frac);
                    }
                }
            }
        }
        last_valid = Some(i);
    }
    out
}

pub fn forward_fill(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut last = None;
    values
        .iter()
        .map(|v| {
            if v.is_some() {
                last = *v;
            }
            last
        })
        .collect()
}

/// Apply the configured missing-data policy for one meteorological signal.
pub fn apply_missing_data_policy(
    values: &[Option<f64>],
    cfg: &PipelineConfig,
    canonical_signal: &str,
) -> Vec<Option<f64>> {
    let mut out = values.to_vec();
    if cfg.allow_interp_signals.contains(canonical_signal) {
        out = interpolate_limited(&out, cfg.max_interp_gap_points());
    }
    if cfg.allow_ffill_signals.contains(canonical_signal) {
        out = forward_fill(&out);
    }
    out
}

/// Successive differences of a cumulative counter. Decreases below the reset
/// threshold are meter resets/rollovers and become null.
pub fn counter_to_interval(counter: &SignalSeries, reset_threshold: f64) -> SignalSeries {
    let mut out = SignalSeries::new();
    let mut prev: Option<Option<f64>> = None;
    for (ts, value) in counter {
        let delta = match (prev, value) {
            (Some(Some(p)), Some(v)) => Some(v - p).filter(|d| *d >= reset_threshold),
            _ => None,
        };
        out.insert(*ts, delta);
        prev = Some(*value);
    }
    out
}

fn completeness(
    rs: &ResampledTable,
    cfg: &PipelineConfig,
    plant: &str,
    level: ComponentType,
    poa: Option<&SignalSeries>,
) -> Option<f64> {
    let power = ResampledTable::sum_by_ts(rs.select(plant, Some(level), |s| s == POWER_SIGNAL));
    if power.is_empty() {
        return None;
    }

    let present_fraction = |flags: Vec<bool>| -> f64 {
        if flags.is_empty() {
            0.0
        } else {
            flags.iter().filter(|&&f| f).count() as f64 / flags.len() as f64
        }
    };

    match poa {
        Some(poa) => {
            let is_present = |ts: &Timestamp| matches!(power.get(ts), Some(Some(_)));
            let daylight: Vec<&Timestamp> = poa
                .iter()
                .filter(|(_, v)| v.map_or(false, |x| x >= cfg.daylight_poa_threshold_wm2))
                .map(|(ts, _)| ts)
                .collect();
            if daylight.is_empty() {
                Some(present_fraction(poa.keys().map(is_present).collect()))
            } else {
                Some(present_fraction(daylight.into_iter().map(is_present).collect()))
            }
        }
        None => Some(present_fraction(power.values().map(Option::is_some).collect())),
    }
}

/// Pick the power aggregation level (array vs array group) by daylight completeness.
pub fn choose_power_level(
    rs: &ResampledTable,
    cfg: &PipelineConfig,
    plant: &str,
    poa: Option<&SignalSeries>,
) -> PowerLevelDecision {
    if rs.select(plant, None, |s| s == POWER_SIGNAL).next().is_none() {
        return PowerLevelDecision {
            level: None,
            reason: format!("No {}", POWER_SIGNAL),
        };
    }

    let c_array = completeness(rs, cfg, plant, ComponentType::Array, poa);
    let c_group = completeness(rs, cfg, plant, ComponentType::ArrayGroup, poa);

    match (c_array, c_group) {
        (None, None) => PowerLevelDecision {
            level: None,
            reason: "No array or array_group power".to_string(),
        },
        (Some(a), None) => PowerLevelDecision {
            level: Some(ComponentType::Array),
            reason: format!("array completeness {:.3}, no group power", a),
        },
        (None, Some(g)) => PowerLevelDecision {
            level: Some(ComponentType::ArrayGroup),
            reason: format!("group completeness {:.3}, no array power", g),
        },
        (Some(a), Some(g)) if a >= g => PowerLevelDecision {
            level: Some(ComponentType::Array),
            reason: format!("array completeness {:.3} >= group {:.3}", a, g),
        },
        (Some(a), Some(g)) => PowerLevelDecision {
            level: Some(ComponentType::ArrayGroup),
            reason: format!("group completeness {:.3} > array {:.3}", g, a),
        },
    }
}

/// Interval energy at the chosen level: explicit interval signal first, else
/// differences of the summed counter of the preferred family.
fn plant_energy_series(
    rs: &ResampledTable,
    cfg: &PipelineConfig,
    plant: &str,
    level: ComponentType,
) -> Option<SignalSeries> {
    let interval = ResampledTable::sum_by_ts(rs.select(plant, Some(level), |s| s == ENERGY_INTERVAL_SIGNAL));
    if !interval.is_empty() {
        return Some(interval);
    }

    COUNTER_FAMILIES.iter().find_map(|family| {
        let counter = ResampledTable::sum_by_ts(rs.select(plant, Some(level), |s| s == *family));
        (!counter.is_empty())
            .then(|| counter_to_interval(&counter, cfg.counter_reset_negative_kwh_threshold))
    })
}

fn reindex(series: Option<&SignalSeries>, index: &[Timestamp]) -> Vec<Option<f64>> {
    match series {
        Some(s) => index.iter().map(|ts| s.get(ts).copied().flatten()).collect(),
        None => vec![None; index.len()],
    }
}

fn clip_to_range(values: &mut [Option<f64>], min: f64, max: f64) {
    for v in values.iter_mut() {
        if v.map_or(false, |x| x < min || x > max) {
            *v = None;
        }
    }
}

/// Join irradiance, module temperature, power and energy onto one plant index
/// (the union of contributing timestamps), then apply the met-only missing-data
/// policy and plausibility clipping. Power and energy are never filled.
pub fn build_plant_series(
    rs: &ResampledTable,
    cfg: &PipelineConfig,
    plant: &str,
    poa: Option<&SignalSeries>,
    tmod: Option<&SignalSeries>,
    level: Option<ComponentType>,
) -> Result<PlantTimeSeries, DataIssue> {
    let power = level
        .map(|l| ResampledTable::sum_by_ts(rs.select(plant, Some(l), |s| s == POWER_SIGNAL)))
        .filter(|p| !p.is_empty());
    let energy = level.and_then(|l| plant_energy_series(rs, cfg, plant, l));

    let index: BTreeSet<Timestamp> = [poa, tmod, power.as_ref(), energy.as_ref()]
        .into_iter()
        .flatten()
        .flat_map(|s| s.keys().copied())
        .collect();
    if index.is_empty() {
        return Err(DataIssue::MissingSeries(format!(
            "plant {} has no irradiance, temperature, power or energy series",
            plant
        )));
    }
    let index: Vec<Timestamp> = index.into_iter().collect();

    let mut poa_wm2 = apply_missing_data_policy(&reindex(poa, &index), cfg, POA_SIGNAL);
    let mut tmod_c = apply_missing_data_policy(&reindex(tmod, &index), cfg, TMOD_SIGNAL);
    // discard implausible readings rather than clamping them
    clip_to_range(&mut poa_wm2, cfg.min_valid_poa_wm2, cfg.max_valid_poa_wm2);
    clip_to_range(&mut tmod_c, cfg.min_valid_tmod_c, cfg.max_valid_tmod_c);

    Ok(PlantTimeSeries {
        p_ac_kw: reindex(power.as_ref(), &index),
        e_kwh: reindex(energy.as_ref(), &index),
        index,
        poa_wm2,
        tmod_c,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResampledRecord, SeriesKey, SignalType};
    use chrono::{Duration, TimeZone};
    use chrono_tz::UTC;
    use std::sync::Arc;

    fn t(i: i64) -> Timestamp {
        UTC.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap() + Duration::minutes(5 * i)
    }

    fn push(rs: &mut ResampledTable, level: ComponentType, id: &str, signal: &str, values: &[Option<f64>]) {
        let key = Arc::new(SeriesKey {
            plant_name: Some("P1".to_string()),
            component_type: level,
            component_id: id.to_string(),
            canonical_signal: signal.to_string(),
            unit: None,
        });
        for (i, v) in values.iter().enumerate() {
            rs.records.push(ResampledRecord {
                ts: t(i as i64),
                key: Arc::clone(&key),
                signal_type: SignalType::from_canonical(signal),
                value_rs: *v,
            });
        }
    }

    #[test]
    fn test_counter_reset_is_nulled() {
        let counter: SignalSeries = [10.0, 12.0, 11.0, 15.0]
            .iter()
            .enumerate()
            .map(|(i, v)| (t(i as i64), Some(*v)))
            .collect();
        let deltas: Vec<_> = counter_to_interval(&counter, -0.01).into_values().collect();
        assert_eq!(deltas, vec![None, Some(2.0), None, Some(4.0)]);
    }

    #[test]
    fn test_small_negative_counter_jitter_is_kept() {
        let counter: SignalSeries = [100.0, 99.995]
            .iter()
            .enumerate()
            .map(|(i, v)| (t(i as i64), Some(*v)))
            .collect();
        let deltas: Vec<_> = counter_to_interval(&counter, -0.01).into_values().collect();
        assert!(deltas[1].unwrap() < 0.0);
    }

    #[test]
    fn test_interpolation_respects_gap_cap() {
        // 20-minute gap at 5-minute frequency: four missing points
        let values = vec![Some(0.0), None, None, None, None, Some(50.0)];

        let capped = PipelineConfig::default();
        assert_eq!(capped.max_interp_gap_points(), 3);
        let out = apply_missing_data_policy(&values, &capped, POA_SIGNAL);
        assert_eq!(out, values);

        let wide = PipelineConfig {
            max_interp_gap_minutes: 20,
            ..PipelineConfig::default()
        };
        let out = apply_missing_data_policy(&values, &wide, POA_SIGNAL);
        assert_eq!(out, vec![Some(0.0), Some(10.0), Some(20.0), Some(30.0), Some(40.0), Some(50.0)]);

        // power is not in the allow-list
        let out = apply_missing_data_policy(&values, &wide, POWER_SIGNAL);
        assert_eq!(out, values);
    }

    #[test]
    fn test_edges_are_not_interpolated_and_ffill() {
        let values = vec![None, Some(1.0), None, Some(3.0), None];
        assert_eq!(interpolate_limited(&values, 3), vec![None, Some(1.0), Some(2.0), Some(3.0), None]);
        assert_eq!(forward_fill(&values), vec![None, Some(1.0), Some(1.0), Some(3.0), Some(3.0)]);
    }

    #[test]
    fn test_choose_power_level_prefers_more_complete_level() {
        let mut rs = ResampledTable::default();
        push(&mut rs, ComponentType::Unknown, "unknown", POA_SIGNAL, &[Some(300.0); 4]);
        push(&mut rs, ComponentType::Array, "1", POWER_SIGNAL, &[Some(1.0), None, None, Some(1.0)]);
        push(&mut rs, ComponentType::ArrayGroup, "G1", POWER_SIGNAL, &[Some(1.0); 4]);
        let cfg = PipelineConfig::default();
        let poa = plant_met_series(&rs, "P1", POA_SIGNAL).unwrap();

        let decision = choose_power_level(&rs, &cfg, "P1", Some(&poa));
        assert_eq!(decision.level, Some(ComponentType::ArrayGroup));

        // ties favour array
        let mut tie = ResampledTable::default();
        push(&mut tie, ComponentType::Array, "1", POWER_SIGNAL, &[Some(1.0); 4]);
        push(&mut tie, ComponentType::ArrayGroup, "G1", POWER_SIGNAL, &[Some(1.0); 4]);
        assert_eq!(choose_power_level(&tie, &cfg, "P1", None).level, Some(ComponentType::Array));

        let empty = ResampledTable::default();
        let none = choose_power_level(&empty, &cfg, "P1", None);
        assert_eq!(none.level, None);
        assert!(none.reason.contains("ac_power_kw"));

        let mut inverter_only = ResampledTable::default();
        push(&mut inverter_only, ComponentType::Inverter, "1", POWER_SIGNAL, &[Some(1.0)]);
        let none = choose_power_level(&inverter_only, &cfg, "P1", None);
        assert_eq!(none.level, None);
        assert_eq!(none.reason, "No array or array_group power");
    }

    #[test]
    fn test_build_plant_series_joins_and_clips() {
        let mut rs = ResampledTable::default();
        push(&mut rs, ComponentType::Unknown, "unknown", POA_SIGNAL, &[Some(100.0), Some(1500.0), Some(300.0)]);
        push(&mut rs, ComponentType::Unknown, "unknown", TMOD_SIGNAL, &[Some(25.0), Some(-40.0), Some(30.0)]);
        push(&mut rs, ComponentType::Array, "1", POWER_SIGNAL, &[Some(5.0), Some(6.0), Some(7.0), Some(8.0)]);
        push(&mut rs, ComponentType::Array, "1", "energy_kwh_counter", &[Some(10.0), Some(12.0), Some(11.0), Some(15.0)]);
        push(&mut rs, ComponentType::Array, "1", "energy_kwh_counter_measured", &[Some(500.0); 4]);
        let cfg = PipelineConfig::default();
        let poa = plant_met_series(&rs, "P1", POA_SIGNAL);
        let tmod = plant_met_series(&rs, "P1", TMOD_SIGNAL);

        let series = build_plant_series(&rs, &cfg, "P1", poa.as_ref(), tmod.as_ref(), Some(ComponentType::Array)).unwrap();
        assert_eq!(series.len(), 4);
        assert_eq!(series.poa_wm2, vec![Some(100.0), None, Some(300.0), None]);
        assert_eq!(series.tmod_c, vec![Some(25.0), None, Some(30.0), None]);
        assert_eq!(series.p_ac_kw, vec![Some(5.0), Some(6.0), Some(7.0), Some(8.0)]);
        assert_eq!(series.e_kwh, vec![None, Some(2.0), None, Some(4.0)]);
    }

    #[test]
    fn test_build_plant_series_without_data() {
        let rs = ResampledTable::default();
        let cfg = PipelineConfig::default();
        let err = build_plant_series(&rs, &cfg, "P1", None, None, None).unwrap_err();
        assert_eq!(err.kind(), "missing_series");
    }
}
