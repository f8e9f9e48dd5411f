use crate::config::PipelineConfig;
use crate::models::LabeledSeries;
use crate::reshape::parse_value;
use crate::stats::{mean, median};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

/// Metadata columns that may carry the nameplate DC capacity, in lookup order.
const DC_CAPACITY_COLUMNS: [&str; 4] = ["DC_kWp", "dc_kwp", "dc_kWp", "dc_kw"];

/// The performance index needs more than this many intrinsic daylight rows.
const PERF_INDEX_MIN_ROWS: usize = 100;

/// One metadata row, cells kept as text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlantMetadata {
    pub plant_name: String,
    pub values: BTreeMap<String, String>,
}

/// Nameplate DC capacity of `plant`; requires exactly one metadata row for it.
pub fn get_dc_kwp(metadata: &[PlantMetadata], plant: &str) -> Option<f64> {
    let mut rows = metadata.iter().filter(|m| m.plant_name == plant);
    let row = rows.next()?;
    if rows.next().is_some() {
        log::warn!("Plant {} has more than one metadata row, ignoring DC capacity", plant);
        return None;
    }
    DC_CAPACITY_COLUMNS
        .iter()
        .find_map(|col| row.values.get(*col).and_then(|v| parse_value(v)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyKpi {
    pub date: NaiveDate,
    pub energy_kwh: Option<f64>,
    pub energy_kwh_intrinsic: Option<f64>,
    pub specific_yield_kwh_per_kwp: Option<f64>,
    pub perf_index_median: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyKpi {
    /// First day of the month
    pub month: NaiveDate,
    pub energy_kwh: f64,
    pub energy_kwh_intrinsic: f64,
    pub perf_index_median: Option<f64>,
    pub specific_yield_kwh_per_kwp: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct KpiReport {
    /// Interval energy used for the KPIs, one value per row
    pub energy_kwh: Vec<Option<f64>>,
    pub perf_index: Vec<Option<f64>>,
    pub daily: Vec<DailyKpi>,
    pub monthly: Vec<MonthlyKpi>,
}

fn sum_min_count_1(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum())
    }
}

/// Daily and monthly energy, specific yield and performance-index KPIs.
pub fn compute_kpis(labeled: &LabeledSeries, cfg: &PipelineConfig, dc_kwp: Option<f64>) -> KpiReport {
    let s = &labeled.series;
    let n = labeled.len();
    let dt_h = cfg.interval_hours();
    let dc_kwp = dc_kwp.filter(|kwp| *kwp > 0.0);

    // metered energy when any is present, else derived from power
    let energy_kwh: Vec<Option<f64>> = if s.e_kwh.iter().any(Option::is_some) {
        s.e_kwh.clone()
    } else {
        s.p_ac_kw.iter().map(|p| p.map(|p| p * dt_h)).collect()
    };

    let kpi_rows: Vec<bool> = (0..n)
        .map(|i| {
            labeled.event_label[i].is_intrinsic()
                && s.poa_wm2[i].map_or(false, |poa| poa >= cfg.poa_for_kpi_min_wm2)
                && s.p_ac_kw[i].is_some()
        })
        .collect();
    let ratio = |i: usize| -> Option<f64> {
        let r = s.p_ac_kw[i]? / s.poa_wm2[i]?;
        r.is_finite().then_some(r)
    };

    let mut perf_index = vec![None; n];
    if kpi_rows.iter().filter(|&&k| k).count() > PERF_INDEX_MIN_ROWS {
        let ratios: Vec<f64> = (0..n).filter(|&i| kpi_rows[i]).filter_map(ratio).collect();
        if let Some(scale) = median(&ratios).filter(|m| m.is_finite() && *m > 0.0) {
            for i in (0..n).filter(|&i| kpi_rows[i]) {
                perf_index[i] = ratio(i).map(|r| r / scale);
            }
        }
    }

    // per local calendar day
    let mut buckets: BTreeMap<NaiveDate, (Vec<f64>, Vec<f64>, Vec<f64>)> = BTreeMap::new();
    if let (Some(first), Some(last)) = (s.index.first(), s.index.last()) {
        for day in first.date_naive().iter_days().take_while(|d| *d <= last.date_naive()) {
            buckets.insert(day, Default::default());
        }
    }
    for (i, ts) in s.index.iter().enumerate() {
        if let Some((energy, intrinsic, perf)) = buckets.get_mut(&ts.date_naive()) {
            if let Some(e) = energy_kwh[i] {
                energy.push(e);
                if labeled.event_label[i].is_intrinsic() {
                    intrinsic.push(e);
                }
            }
            if let Some(p) = perf_index[i] {
                perf.push(p);
            }
        }
    }

    let daily: Vec<DailyKpi> = buckets
        .into_iter()
        .map(|(date, (energy, intrinsic, perf))| {
            let energy_kwh_intrinsic = sum_min_count_1(&intrinsic);
            DailyKpi {
                date,
                energy_kwh: sum_min_count_1(&energy),
                energy_kwh_intrinsic,
                specific_yield_kwh_per_kwp: dc_kwp.and_then(|kwp| energy_kwh_intrinsic.map(|e| e / kwp)),
                perf_index_median: median(&perf),
            }
        })
        .collect();

    let monthly = monthly_rollup(&daily);
    KpiReport {
        energy_kwh,
        perf_index,
        daily,
        monthly,
    }
}

fn monthly_rollup(daily: &[DailyKpi]) -> Vec<MonthlyKpi> {
    let mut months: BTreeMap<NaiveDate, Vec<&DailyKpi>> = BTreeMap::new();
    for day in daily {
        if let Some(month) = day.date.with_day(1) {
            months.entry(month).or_default().push(day);
        }
    }

    months
        .into_iter()
        .map(|(month, days)| {
            let perf: Vec<f64> = days.iter().filter_map(|d| d.perf_index_median).collect();
            let yields: Vec<f64> = days.iter().filter_map(|d| d.specific_yield_kwh_per_kwp).collect();
            MonthlyKpi {
                month,
                energy_kwh: days.iter().filter_map(|d| d.energy_kwh).sum(),
                energy_kwh_intrinsic: days.iter().filter_map(|d| d.energy_kwh_intrinsic).sum(),
                perf_index_median: median(&perf),
                specific_yield_kwh_per_kwp: mean(&yields),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventLabel, PlantTimeSeries};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};
    use chrono_tz::UTC;

    fn hourly(days: i64, start_day: u32) -> LabeledSeries {
        let t0 = UTC.with_ymd_and_hms(2024, 1, start_day, 0, 0, 0).unwrap();
        let n = (days * 24) as usize;
        let mut s = PlantTimeSeries::default();
        for i in 0..n {
            let hour = i % 24;
            let poa = if (7..17).contains(&hour) { 800.0 } else { 0.0 };
            s.index.push(t0 + Duration::hours(i as i64));
            s.poa_wm2.push(Some(poa));
            s.tmod_c.push(Some(25.0));
            s.p_ac_kw.push(Some(poa * 0.5));
            s.e_kwh.push(None);
        }
        LabeledSeries::unlabeled(s)
    }

    fn hourly_cfg() -> PipelineConfig {
        PipelineConfig {
            standard_freq: Duration::hours(1),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_daily_energy_from_power_and_specific_yield() {
        let mut labeled = hourly(2, 1);
        labeled.event_label[8] = EventLabel::Curtailment;
        let report = compute_kpis(&labeled, &hourly_cfg(), Some(400.0));

        assert_eq!(report.daily.len(), 2);
        let d1 = &report.daily[0];
        assert_relative_eq!(d1.energy_kwh.unwrap(), 10.0 * 400.0);
        assert_relative_eq!(d1.energy_kwh_intrinsic.unwrap(), 9.0 * 400.0);
        assert_relative_eq!(d1.specific_yield_kwh_per_kwp.unwrap(), 9.0);
        // too few rows for a performance index
        assert!(d1.perf_index_median.is_none());
    }

    #[test]
    fn test_perf_index_and_monthly_rollup() {
        // Jan 30 to Feb 10: 12 days x 10 daylight hours
        let mut labeled = hourly(12, 30);
        // one degraded day
        for i in 24..48 {
            labeled.series.p_ac_kw[i] = labeled.series.p_ac_kw[i].map(|p| p * 0.8);
        }
        let report = compute_kpis(&labeled, &hourly_cfg(), None);

        assert_relative_eq!(report.daily[0].perf_index_median.unwrap(), 1.0);
        assert_relative_eq!(report.daily[1].perf_index_median.unwrap(), 0.8);
        assert!(report.daily.iter().all(|d| d.specific_yield_kwh_per_kwp.is_none()));
        assert!(report.perf_index[0].is_none());

        assert_eq!(report.monthly.len(), 2);
        assert_eq!(report.monthly[0].month, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_relative_eq!(report.monthly[0].energy_kwh, 4000.0 + 0.8 * 4000.0);
        assert_relative_eq!(report.monthly[0].perf_index_median.unwrap(), 0.9);
        assert_relative_eq!(report.monthly[1].energy_kwh, 10.0 * 4000.0);
    }

    #[test]
    fn test_metered_energy_preferred() {
        let mut labeled = hourly(1, 1);
        labeled.series.e_kwh[10] = Some(123.0);
        let report = compute_kpis(&labeled, &hourly_cfg(), None);
        assert_eq!(report.daily[0].energy_kwh, Some(123.0));
    }

    #[test]
    fn test_get_dc_kwp() {
        let row = |plant: &str, col: &str, v: &str| PlantMetadata {
            plant_name: plant.to_string(),
            values: [(col.to_string(), v.to_string())].into_iter().collect(),
        };
        let meta = vec![row("A", "dc_kwp", "1250,5"), row("B", "DC_kWp", "900"), row("B", "DC_kWp", "950")];
        assert_eq!(get_dc_kwp(&meta, "A"), Some(1250.5));
        assert_eq!(get_dc_kwp(&meta, "B"), None);
        assert_eq!(get_dc_kwp(&meta, "C"), None);
    }
}
