use crate::config::PipelineConfig;
use crate::models::{ComponentType, LongTable, ResampledRecord, ResampledTable, SeriesKey, SignalSeries, SignalType};
use crate::stats::median;
use crate::timegrid::{floor_to_grid, Timestamp};
use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Timestamp audit of one plant's raw series.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeIndexAudit {
    pub plant_name: Option<String>,
    pub min_ts: Option<Timestamp>,
    pub max_ts: Option<Timestamp>,
    pub dup_frac: Option<f64>,
    pub median_dt_min: Option<f64>,
    pub n: usize,
}

/// Per-plant duplicate fraction and median sample spacing. Duplicates are counted
/// within each raw column's stream and pooled over the plant's columns.
pub fn compute_time_index_audit(long: &LongTable) -> Vec<TimeIndexAudit> {
    let mut streams: BTreeMap<Option<&str>, BTreeMap<&str, Vec<Timestamp>>> = BTreeMap::new();
    for rec in &long.records {
        let plant = streams.entry(rec.plant_name()).or_default();
        let stream = plant.entry(rec.raw_column_name()).or_default();
        if let Some(ts) = rec.ts {
            stream.push(ts);
        }
    }

    streams
        .into_iter()
        .map(|(plant, columns)| {
            let mut n = 0usize;
            let mut dups = 0usize;
            let mut deltas_min = Vec::new();
            let mut min_ts: Option<Timestamp> = None;
            let mut max_ts: Option<Timestamp> = None;

            for mut ts in columns.into_values() {
                if ts.is_empty() {
                    continue;
                }
                ts.sort();
                n += ts.len();
                min_ts = Some(min_ts.map_or(ts[0], |m| m.min(ts[0])));
                let last = ts[ts.len() - 1];
                max_ts = Some(max_ts.map_or(last, |m| m.max(last)));

                let before = ts.len();
                ts.dedup();
                dups += before - ts.len();
                deltas_min.extend(
                    ts.windows(2)
                        .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 60_000.0),
                );
            }

            TimeIndexAudit {
                plant_name: plant.map(str::to_string),
                min_ts,
                max_ts,
                dup_frac: (n > 0).then(|| dups as f64 / n as f64),
                median_dt_min: median(&deltas_min),
                n,
            }
        })
        .collect()
}

fn aggregate_bucket(signal_type: SignalType, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match signal_type {
        // cumulative meter: only the latest reading in the bucket is meaningful
        SignalType::Counter => values.last().copied(),
        SignalType::EnergyInterval => Some(values.iter().sum()),
        SignalType::InstantOrAvg => Some(values.iter().sum::<f64>() / values.len() as f64),
    }
}

/// Resample one sorted series onto the `step` grid, from the first to the last
/// occupied bucket. Buckets without a reading stay null.
pub fn resample_series(
    samples: &[(Timestamp, Option<f64>)],
    signal_type: SignalType,
    step: Duration,
) -> Vec<(Timestamp, Option<f64>)> {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return Vec::new();
    };

    let mut buckets: BTreeMap<Timestamp, Vec<f64>> = BTreeMap::new();
    for (ts, value) in samples {
        let bucket = buckets.entry(floor_to_grid(*ts, step)).or_default();
        if let Some(v) = value {
            bucket.push(*v);
        }
    }

    let end = floor_to_grid(last.0, step);
    let mut out = Vec::new();
    let mut cursor = floor_to_grid(first.0, step);
    while cursor <= end {
        let value = buckets
            .get(&cursor)
            .and_then(|vals| aggregate_bucket(signal_type, vals));
        out.push((cursor, value));
        cursor = cursor + step;
    }
    out
}

/// Group the long table by (plant, component type, component id, canonical signal, unit)
/// and resample every group onto the standard grid with its signal type's rule.
pub fn resample_signals(long: &LongTable, cfg: &PipelineConfig) -> ResampledTable {
    let mut groups: BTreeMap<SeriesKey, Vec<(Timestamp, Option<f64>)>> = BTreeMap::new();
    for rec in &long.records {
        let Some(ts) = rec.ts else { continue };
        let key = SeriesKey {
            plant_name: rec.signal.plant_name.clone(),
            component_type: rec.signal.component_type,
            component_id: rec.signal.component_id.clone(),
            canonical_signal: rec.signal.canonical_signal.clone(),
            unit: rec.signal.unit.clone(),
        };
        groups.entry(key).or_default().push((ts, rec.value));
    }

    let n_groups = groups.len();
    let mut records = Vec::new();
    for (key, mut samples) in groups {
        // stable sort keeps the source order of duplicate timestamps for `last`
        samples.sort_by_key(|(ts, _)| *ts);
        let signal_type = SignalType::from_canonical(&key.canonical_signal);
        let key = Arc::new(key);
        for (ts, value_rs) in resample_series(&samples, signal_type, cfg.standard_freq) {
            records.push(ResampledRecord {
                ts,
                key: Arc::clone(&key),
                signal_type,
                value_rs,
            });
        }
    }

    log::info!(
        "Resampled {} signal groups into {} grid records",
        n_groups,
        records.len()
    );
    ResampledTable { records }
}

impl ResampledTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn extend(&mut self, other: ResampledTable) {
        self.records.extend(other.records);
    }

    /// Distinct named plants, sorted.
    pub fn plant_names(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self
            .records
            .iter()
            .filter_map(|r| r.key.plant_name.as_deref())
            .collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// Records of one plant matching a signal predicate and optional component level.
    pub fn select<'a, F>(
        &'a self,
        plant: &'a str,
        level: Option<ComponentType>,
        signal: F,
    ) -> impl Iterator<Item = &'a ResampledRecord> + 'a
    where
        F: Fn(&str) -> bool + 'a,
    {
        self.records.iter().filter(move |r| {
            r.key.plant_name.as_deref() == Some(plant)
                && level.map_or(true, |l| r.key.component_type == l)
                && signal(&r.key.canonical_signal)
        })
    }

    /// Sum across components per timestamp; a timestamp with no non-null value stays null.
    pub fn sum_by_ts<'a>(records: impl Iterator<Item = &'a ResampledRecord>) -> SignalSeries {
        let mut out: SignalSeries = BTreeMap::new();
        for r in records {
            let slot = out.entry(r.ts).or_insert(None);
            if let Some(v) = r.value_rs {
                *slot = Some(slot.unwrap_or(0.0) + v);
            }
        }
        out
    }

    /// Median across components per timestamp.
    pub fn median_by_ts<'a>(records: impl Iterator<Item = &'a ResampledRecord>) -> SignalSeries {
        let mut grouped: BTreeMap<Timestamp, Vec<f64>> = BTreeMap::new();
        for r in records {
            let vals = grouped.entry(r.ts).or_default();
            if let Some(v) = r.value_rs {
                vals.push(v);
            }
        }
        grouped
            .into_iter()
            .map(|(ts, vals)| (ts, median(&vals)))
            .collect()
    }
}
