use chrono::{Duration, TimeZone};
use pv_health::{
    ingest, run_fleet, EventNormalizer, FleetContext, HuberRegressor, PipelineConfig, RawEvent,
    SignalMapper, WideColumn, WideTable,
};

fn main() -> anyhow::Result<()> {
    // Ten days of 5-minute data for a single-array plant
    let tz = chrono_tz::Europe::Athens;
    let t0 = tz.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let n = 10 * 288;

    let mut poa = Vec::with_capacity(n);
    let mut tmod = Vec::with_capacity(n);
    let mut power = Vec::with_capacity(n);
    for i in 0..n {
        let hour = (i % 288) as f64 / 12.0;
        let g = (1000.0 * ((hour - 6.0) / 14.0 * std::f64::consts::PI).sin()).max(0.0);
        let t = 18.0 + g * 0.03;
        // afternoon clipping on day 6 looks like underperformance
        let p = if i / 288 == 6 && hour > 13.0 { g * 0.2 } else { 0.45 * g * (1.0 - 0.004 * (t - 25.0)) };
        poa.push(g);
        tmod.push(t);
        power.push(p);
    }

    let column = |name: &str, values: &[f64]| WideColumn {
        name: format!("[Demo] Array 1 {}", name),
        cells: values.iter().map(|v| Some(format!("{:.3}", v))).collect(),
    };
    let wide = WideTable {
        timestamps: (0..n).map(|i| Some(t0 + Duration::minutes(5 * i as i64))).collect(),
        columns: vec![
            column("Total Irradiance (W/m2)", &poa),
            column("Module Temperature (C)", &tmod),
            column("Array output power (kW)", &power),
        ],
    };

    let cfg = PipelineConfig {
        model_min_points: 500,
        walkforward_train_days: 4,
        walkforward_test_days: 2,
        ..PipelineConfig::default()
    };
    let mapper = SignalMapper::new()?;
    let ingested = ingest(&[wide], &mapper, &cfg);

    let normalizer = EventNormalizer::new()?;
    let raw_events = vec![RawEvent {
        start: Some(t0 + Duration::days(3) + Duration::hours(10)),
        duration: Some("02:00:00".to_string()),
        description: Some("Active power limit from grid operator".to_string()),
        source: Some("[Demo] PPC".to_string()),
        ..Default::default()
    }];
    let events = pv_health::pipeline::prepare_events(&normalizer, &raw_events, &ingested.resampled.plant_names());

    let regressor = HuberRegressor::default();
    let ctx = FleetContext {
        cfg: &cfg,
        resampled: &ingested.resampled,
        events: &events,
        metadata: &[],
        regressor: &regressor,
    };

    for report in run_fleet(&ctx) {
        println!("Plant {}", report.plant_name);
        println!("===================");
        println!("Model ok: {} ({})", report.ok, report.reason.as_deref().unwrap_or("-"));
        println!("Power level: {}", report.power_level.reason);
        println!("Point anomalies: {}", report.anomaly_count());
        println!("DQ score: {:.2} ({})", report.dq.dq_score, report.dq.monitoring_confidence);

        if let Some(wf) = &report.walkforward {
            for w in &wf.windows {
                println!(
                    "  walk-forward {} -> {}: ok={} mae={:?}",
                    w.train_start.format("%Y-%m-%d"),
                    w.test_end.format("%Y-%m-%d"),
                    w.ok,
                    w.mae_kw
                );
            }
        }
        if let Some(losses) = &report.losses {
            println!();
            println!("Daily losses (kWh):");
            for day in &losses.daily {
                println!(
                    "  {}  total {:8.1}  curtailment {:6.1}  unexplained {:8.1}",
                    day.date, day.loss_kwh, day.loss_curtailment, day.loss_unexplained
                );
            }
        }
    }
    Ok(())
}
