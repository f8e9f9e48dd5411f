use crate::config::{LossSignPolicy, PipelineConfig};
use crate::models::{EventLabel, ResidualTable};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-row energy and loss columns, aligned with the residual table rows.
#[derive(Debug, Clone, Default)]
pub struct LossRows {
    pub e_exp_kwh: Vec<Option<f64>>,
    pub e_act_kwh: Vec<Option<f64>>,
    pub loss_kwh: Vec<Option<f64>>,
    /// One column per entry of [`EventLabel::CATEGORIES`]
    pub loss_by_category: [Vec<Option<f64>>; 6],
    pub loss_unexplained: Vec<f64>,
}

/// Daily loss totals on the plant's local calendar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyLoss {
    pub date: NaiveDate,
    pub loss_kwh: f64,
    pub loss_unexplained: f64,
    pub loss_curtailment: f64,
    pub loss_grid_outage: f64,
    pub loss_planned_maintenance: f64,
    pub loss_inverter_fault: f64,
    pub loss_comms_data: f64,
    pub loss_other_unknown: f64,
    /// Signed loss on rows carrying an event label. Equals the sum of the
    /// category buckets under the signed policy; with positive-only buckets
    /// the bucket sum can exceed it.
    pub loss_labelled: f64,
    /// Loss on rows without any event label
    pub loss_unlabelled: f64,
}

impl DailyLoss {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            loss_kwh: 0.0,
            loss_unexplained: 0.0,
            loss_curtailment: 0.0,
            loss_grid_outage: 0.0,
            loss_planned_maintenance: 0.0,
            loss_inverter_fault: 0.0,
            loss_comms_data: 0.0,
            loss_other_unknown: 0.0,
            loss_labelled: 0.0,
            loss_unlabelled: 0.0,
        }
    }

    fn bucket_mut(&mut self, label: EventLabel) -> Option<&mut f64> {
        match label {
            EventLabel::Curtailment => Some(&mut self.loss_curtailment),
            EventLabel::GridOutage => Some(&mut self.loss_grid_outage),
            EventLabel::PlannedMaintenance => Some(&mut self.loss_planned_maintenance),
            EventLabel::InverterFault => Some(&mut self.loss_inverter_fault),
            EventLabel::CommsData => Some(&mut self.loss_comms_data),
            EventLabel::OtherUnknown => Some(&mut self.loss_other_unknown),
            EventLabel::None => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LossReport {
    pub rows: LossRows,
    pub daily: Vec<DailyLoss>,
}

impl LossReport {
    pub fn total_loss_kwh(&self) -> f64 {
        self.daily.iter().map(|d| d.loss_kwh).sum()
    }
}

/// Split expected-minus-actual energy into event buckets and unexplained loss,
/// per row and per local calendar day.
pub fn compute_losses(table: &ResidualTable, cfg: &PipelineConfig) -> LossReport {
    let n = table.len();
    let dt_h = cfg.interval_hours();
    let labels = &table.labeled.event_label;
    let series = &table.labeled.series;

    let mut rows = LossRows::default();
    for i in 0..n {
        let daylight = series.poa_wm2[i].map_or(false, |poa| poa >= cfg.poa_for_kpi_min_wm2);
        // no energy is attributed outside daylight
        let e_exp = table.p_expected_kw[i].filter(|_| daylight).map(|p| p * dt_h);
        let e_act = series.p_ac_kw[i].filter(|_| daylight).map(|p| p * dt_h);
        let loss = match (e_exp, e_act) {
            (Some(e), Some(a)) => Some(e - a),
            _ => None,
        };

        for (slot, category) in EventLabel::CATEGORIES.iter().enumerate() {
            let bucket = if labels[i] == *category {
                match cfg.loss_sign_policy {
                    LossSignPolicy::Signed => loss,
                    LossSignPolicy::PositiveOnly => loss.map(|l| l.max(0.0)),
                }
            } else {
                Some(0.0)
            };
            rows.loss_by_category[slot].push(bucket);
        }

        let unexplained = match loss {
            Some(l) if labels[i].is_intrinsic() && l > 0.0 => l,
            _ => 0.0,
        };
        rows.e_exp_kwh.push(e_exp);
        rows.e_act_kwh.push(e_act);
        rows.loss_kwh.push(loss);
        rows.loss_unexplained.push(unexplained);
    }

    let daily = daily_totals(table, &rows);
    LossReport { rows, daily }
}

fn daily_totals(table: &ResidualTable, rows: &LossRows) -> Vec<DailyLoss> {
    let index = &table.labeled.series.index;
    let (Some(first), Some(last)) = (index.first(), index.last()) else {
        return Vec::new();
    };

    let mut days: BTreeMap<NaiveDate, DailyLoss> = first
        .date_naive()
        .iter_days()
        .take_while(|d| *d <= last.date_naive())
        .map(|d| (d, DailyLoss::empty(d)))
        .collect();

    for (i, ts) in index.iter().enumerate() {
        let Some(day) = days.get_mut(&ts.date_naive()) else {
            continue;
        };
        let label = table.labeled.event_label[i];
        if let Some(loss) = rows.loss_kwh[i] {
            day.loss_kwh += loss;
            if label == EventLabel::None {
                day.loss_unlabelled += loss;
            } else {
                day.loss_labelled += loss;
            }
        }
        day.loss_unexplained += rows.loss_unexplained[i];
        for (slot, category) in EventLabel::CATEGORIES.iter().enumerate() {
            if let (Some(v), Some(bucket)) = (rows.loss_by_category[slot][i], day.bucket_mut(*category)) {
                *bucket += v;
            }
        }
    }

    days.into_values().collect()
}
