use thiserror::Error;

/// Locally recovered data problems. None of them aborts a fleet run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataIssue {
    /// Raw signal matched no canonical pattern
    #[error("unmapped signal '{raw_signal}' in column '{column}'")]
    MappingMiss { column: String, raw_signal: String },

    /// Normalized unit disagrees with the canonical signal's expected unit
    #[error("unit mismatch in column '{column}': observed '{observed}', expected '{expected}'")]
    UnitMismatch {
        column: String,
        observed: String,
        expected: String,
    },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// A plant lacks a usable power or irradiance series
    #[error("missing series: {0}")]
    MissingSeries(String),

    #[error("fit failed: {0}")]
    FitFailed(String),
}

impl DataIssue {
    /// Short machine-friendly kind used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            DataIssue::MappingMiss { .. } => "mapping_miss",
            DataIssue::UnitMismatch { .. } => "unit_mismatch",
            DataIssue::InsufficientData(_) => "insufficient_data",
            DataIssue::MissingSeries(_) => "missing_series",
            DataIssue::FitFailed(_) => "fit_failed",
        }
    }
}
