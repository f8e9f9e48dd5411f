use crate::timegrid::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Per-timestamp values of one signal; `None` marks a missing reading.
pub type SignalSeries = BTreeMap<Timestamp, Option<f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Array,
    ArrayGroup,
    Inverter,
    Unknown,
}

impl ComponentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Array => "array",
            ComponentType::ArrayGroup => "array_group",
            ComponentType::Inverter => "inverter",
            ComponentType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation family of a canonical signal, decides the resampling rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Counter,
    EnergyInterval,
    InstantOrAvg,
}

impl SignalType {
    pub fn from_canonical(canonical_signal: &str) -> Self {
        if canonical_signal.starts_with("energy_kwh_counter") {
            SignalType::Counter
        } else if canonical_signal == "energy_kwh_interval" {
            SignalType::EnergyInterval
        } else {
            SignalType::InstantOrAvg
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Counter => "counter",
            SignalType::EnergyInterval => "energy_interval",
            SignalType::InstantOrAvg => "instant_or_avg",
        }
    }
}

/// Event category attached to each timestamp of a plant series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLabel {
    None,
    Curtailment,
    GridOutage,
    PlannedMaintenance,
    InverterFault,
    CommsData,
    OtherUnknown,
}

impl EventLabel {
    /// Categories in labelling priority order (highest first).
    pub const CATEGORIES: [EventLabel; 6] = [
        EventLabel::Curtailment,
        EventLabel::GridOutage,
        EventLabel::PlannedMaintenance,
        EventLabel::InverterFault,
        EventLabel::CommsData,
        EventLabel::OtherUnknown,
    ];

    /// Intrinsic periods exclude external constraints (curtailment, grid outage).
    pub fn is_intrinsic(&self) -> bool {
        !matches!(self, EventLabel::Curtailment | EventLabel::GridOutage)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventLabel::None => "none",
            EventLabel::Curtailment => "curtailment",
            EventLabel::GridOutage => "grid_outage",
            EventLabel::PlannedMaintenance => "planned_maintenance",
            EventLabel::InverterFault => "inverter_fault",
            EventLabel::CommsData => "comms_data",
            EventLabel::OtherUnknown => "other_unknown",
        }
    }
}

impl fmt::Display for EventLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        std::iter::once(EventLabel::None)
            .chain(EventLabel::CATEGORIES)
            .find(|label| label.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("unknown event label '{}'", s))
    }
}

/// One catalog row per raw input column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCatalogEntry {
    pub raw_column_name: String,
    pub plant_name: Option<String>,
    pub component_type: ComponentType,
    pub component_id: String,
    pub raw_signal_name: String,
    pub unit_raw: Option<String>,
    /// Normalized unit
    pub unit: Option<String>,
    pub canonical_signal: String,
    pub mapped: bool,
    /// Pattern that produced the canonical signal
    pub pattern: Option<String>,
    pub expected_unit: Option<String>,
    /// `None` when the signal is unmapped and nothing can be checked
    pub unit_ok: Option<bool>,
}

/// One value of the wide table, annotated with its column's catalog entry.
#[derive(Debug, Clone)]
pub struct LongRecord {
    pub ts: Option<Timestamp>,
    pub value: Option<f64>,
    pub signal: Arc<SignalCatalogEntry>,
}

impl LongRecord {
    pub fn raw_column_name(&self) -> &str {
        &self.signal.raw_column_name
    }

    pub fn plant_name(&self) -> Option<&str> {
        self.signal.plant_name.as_deref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LongTable {
    pub records: Vec<LongRecord>,
}

impl LongTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn extend(&mut self, other: LongTable) {
        self.records.extend(other.records);
    }
}

/// Group key of the resampler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub plant_name: Option<String>,
    pub component_type: ComponentType,
    pub component_id: String,
    pub canonical_signal: String,
    pub unit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResampledRecord {
    pub ts: Timestamp,
    pub key: Arc<SeriesKey>,
    pub signal_type: SignalType,
    pub value_rs: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ResampledTable {
    pub records: Vec<ResampledRecord>,
}

/// Per-plant table on a uniform grid; every column is null-preserving.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlantTimeSeries {
    pub index: Vec<Timestamp>,
    pub poa_wm2: Vec<Option<f64>>,
    pub tmod_c: Vec<Option<f64>>,
    pub p_ac_kw: Vec<Option<f64>>,
    pub e_kwh: Vec<Option<f64>>,
}

impl PlantTimeSeries {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Rows whose timestamp lies in `[start, end)`.
    pub fn slice_range(&self, start: Timestamp, end: Timestamp) -> PlantTimeSeries {
        let rows: Vec<usize> = (0..self.len())
            .filter(|&i| self.index[i] >= start && self.index[i] < end)
            .collect();
        self.take(&rows)
    }

    pub fn take(&self, rows: &[usize]) -> PlantTimeSeries {
        PlantTimeSeries {
            index: rows.iter().map(|&i| self.index[i]).collect(),
            poa_wm2: rows.iter().map(|&i| self.poa_wm2[i]).collect(),
            tmod_c: rows.iter().map(|&i| self.tmod_c[i]).collect(),
            p_ac_kw: rows.iter().map(|&i| self.p_ac_kw[i]).collect(),
            e_kwh: rows.iter().map(|&i| self.e_kwh[i]).collect(),
        }
    }
}

/// Plant series joined with the event label of every timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabeledSeries {
    pub series: PlantTimeSeries,
    pub event_label: Vec<EventLabel>,
}

impl LabeledSeries {
    /// Label every row as `none`.
    pub fn unlabeled(series: PlantTimeSeries) -> Self {
        let event_label = vec![EventLabel::None; series.len()];
        Self { series, event_label }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn slice_range(&self, start: Timestamp, end: Timestamp) -> LabeledSeries {
        let rows: Vec<usize> = (0..self.len())
            .filter(|&i| self.series.index[i] >= start && self.series.index[i] < end)
            .collect();
        LabeledSeries {
            series: self.series.take(&rows),
            event_label: rows.iter().map(|&i| self.event_label[i]).collect(),
        }
    }
}

/// Labeled series augmented with model residuals and anomaly flags.
#[derive(Debug, Clone, Default)]
pub struct ResidualTable {
    pub labeled: LabeledSeries,
    pub p_expected_kw: Vec<Option<f64>>,
    pub residual_kw: Vec<Option<f64>>,
    pub resid_z: Vec<Option<f64>>,
    pub resid_roll_med: Vec<Option<f64>>,
    pub anomaly_point: Vec<bool>,
}

impl ResidualTable {
    pub fn len(&self) -> usize {
        self.labeled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labeled.is_empty()
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomaly_point.iter().filter(|&&a| a).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_type_from_canonical() {
        assert_eq!(SignalType::from_canonical("energy_kwh_counter"), SignalType::Counter);
        assert_eq!(
            SignalType::from_canonical("energy_kwh_counter_measured"),
            SignalType::Counter
        );
        assert_eq!(
            SignalType::from_canonical("energy_kwh_interval"),
            SignalType::EnergyInterval
        );
        assert_eq!(SignalType::from_canonical("ac_power_kw"), SignalType::InstantOrAvg);
        assert_eq!(
            SignalType::from_canonical("unmapped::Something"),
            SignalType::InstantOrAvg
        );
    }

    #[test]
    fn test_event_label_round_trip_and_intrinsic() {
        for label in EventLabel::CATEGORIES {
            assert_eq!(label.as_str().parse::<EventLabel>().unwrap(), label);
        }
        assert!(EventLabel::None.is_intrinsic());
        assert!(EventLabel::InverterFault.is_intrinsic());
        assert!(!EventLabel::Curtailment.is_intrinsic());
        assert!(!EventLabel::GridOutage.is_intrinsic());
        assert!("sunshine".parse::<EventLabel>().is_err());
    }
}
