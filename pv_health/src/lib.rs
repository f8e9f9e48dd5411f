pub mod anomalies;
pub mod config;
pub mod dq;
pub mod events;
pub mod issues;
pub mod kpi;
pub mod losses;
pub mod model;
pub mod models;
pub mod pipeline;
pub mod plant;
pub mod regression;
pub mod reshape;
pub mod signal_mapper;
pub mod stats;
pub mod timebase;
pub mod timegrid;

pub use config::{LossSignPolicy, PipelineConfig};
pub use events::{EventInterval, EventNormalizer, RawEvent};
pub use issues::DataIssue;
pub use kpi::PlantMetadata;
pub use models::{
    ComponentType, EventLabel, LabeledSeries, LongTable, PlantTimeSeries, ResampledTable,
    ResidualTable, SignalCatalogEntry, SignalType,
};
pub use pipeline::{
    ingest, process_plant, run_fleet, run_fleet_with, FleetContext, IngestResult, PlantReport,
};
pub use regression::{HuberRegressor, RobustRegressor};
pub use reshape::{WideColumn, WideTable};
pub use signal_mapper::SignalMapper;
pub use timegrid::Timestamp;
