use chrono::{Duration, TimeZone};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pv_health::model::build_features;
use pv_health::reshape::wide_to_long;
use pv_health::timebase::resample_signals;
use pv_health::{HuberRegressor, PipelineConfig, RobustRegressor, SignalMapper, WideColumn, WideTable};

/// One week of 1-minute samples for a few arrays of one plant.
fn synthetic_wide() -> WideTable {
    let t0 = chrono_tz::UTC.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let n = 7 * 24 * 60;
    let timestamps = (0..n).map(|i| Some(t0 + Duration::minutes(i as i64))).collect();

    let mut columns = Vec::new();
    for array in 1..=4 {
        let poa: Vec<f64> = (0..n)
            .map(|i| {
                let hour = (i % 1440) as f64 / 60.0;
                (1000.0 * ((hour - 6.0) / 12.0 * std::f64::consts::PI).sin()).max(0.0)
            })
            .collect();
        columns.push(WideColumn {
            name: format!("[Bench] Array {} Total Irradiance (W/m2)", array),
            cells: poa.iter().map(|v| Some(format!("{:.1}", v))).collect(),
        });
        columns.push(WideColumn {
            name: format!("[Bench] Array {} Array output power (kW)", array),
            cells: poa.iter().map(|v| Some(format!("{:.2}", v * 0.25))).collect(),
        });
    }
    WideTable { timestamps, columns }
}

fn benchmark_resampling(c: &mut Criterion) {
    let mapper = SignalMapper::new().unwrap();
    let wide = synthetic_wide();
    let catalog = mapper.build_catalog(&wide.column_names(), "Timestamp");
    let long = wide_to_long(&wide, &catalog);
    let cfg = PipelineConfig::default();

    c.bench_function("resample_week_1min_to_5min", |b| {
        b.iter(|| black_box(resample_signals(&long, &cfg)));
    });
}

fn benchmark_huber_fit(c: &mut Criterion) {
    let features: Vec<Vec<f64>> = (0..5000)
        .map(|i| {
            let poa = 200.0 + (i % 800) as f64;
            let tmod = 20.0 + (i % 37) as f64;
            build_features(poa, tmod)
        })
        .collect();
    let target: Vec<f64> = features
        .iter()
        .enumerate()
        .map(|(i, f)| 0.9 * f[0] - 0.003 * f[3] + if i % 50 == 0 { -200.0 } else { 0.0 })
        .collect();
    let regressor = HuberRegressor::default();

    c.bench_function("huber_fit_5000_rows", |b| {
        b.iter(|| black_box(regressor.fit(&features, &target)));
    });
}

criterion_group!(benches, benchmark_resampling, benchmark_huber_fit);
criterion_main!(benches);
