use crate::models::{ComponentType, LongRecord, LongTable, SignalCatalogEntry};
use crate::timegrid::Timestamp;
use std::collections::HashMap;
use std::sync::Arc;

/// One raw column of a wide SCADA table, cells kept as text.
#[derive(Debug, Clone)]
pub struct WideColumn {
    pub name: String,
    pub cells: Vec<Option<String>>,
}

/// Wide table as handed over by the loader: one row per timestamp, one column per header.
#[derive(Debug, Clone, Default)]
pub struct WideTable {
    pub timestamps: Vec<Option<Timestamp>>,
    pub columns: Vec<WideColumn>,
}

impl WideTable {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn n_rows(&self) -> usize {
        self.timestamps.len()
    }
}

/// Parse a cell as a float, accepting a decimal comma. Anything unparseable is null.
pub fn parse_value(cell: &str) -> Option<f64> {
    let normalized = cell.trim().replace(',', ".");
    if normalized.is_empty() {
        return None;
    }
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn unknown_entry(raw_column: &str) -> SignalCatalogEntry {
    SignalCatalogEntry {
        raw_column_name: raw_column.to_string(),
        plant_name: None,
        component_type: ComponentType::Unknown,
        component_id: "unknown".to_string(),
        raw_signal_name: raw_column.to_string(),
        unit_raw: None,
        unit: None,
        canonical_signal: format!("unmapped::{}", raw_column),
        mapped: false,
        pattern: None,
        expected_unit: None,
        unit_ok: None,
    }
}

/// Melt the wide table into one record per (timestamp, raw column), column by column,
/// annotating each value with its catalog entry. Every value row is kept.
pub fn wide_to_long(wide: &WideTable, catalog: &[SignalCatalogEntry]) -> LongTable {
    let by_column: HashMap<&str, &SignalCatalogEntry> = catalog
        .iter()
        .map(|e| (e.raw_column_name.as_str(), e))
        .collect();

    let mut records = Vec::with_capacity(wide.n_rows() * wide.columns.len());
    for column in &wide.columns {
        let entry = Arc::new(match by_column.get(column.name.as_str()) {
            Some(e) => (*e).clone(),
            None => unknown_entry(&column.name),
        });

        for (row, ts) in wide.timestamps.iter().enumerate() {
            let value = column
                .cells
                .get(row)
                .and_then(|c| c.as_deref())
                .and_then(parse_value);
            records.push(LongRecord {
                ts: *ts,
                value,
                signal: Arc::clone(&entry),
            });
        }
    }

    log::info!(
        "Reshaped {} timestamps x {} columns into {} long records",
        wide.n_rows(),
        wide.columns.len(),
        records.len()
    );
    LongTable { records }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal_mapper::SignalMapper;
    use chrono::TimeZone;
    use chrono_tz::UTC;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("12,5"), Some(12.5));
        assert_eq!(parse_value(" 7.25 "), Some(7.25));
        assert_eq!(parse_value("-3"), Some(-3.0));
        assert_eq!(parse_value(""), None);
        assert_eq!(parse_value("n/a"), None);
        assert_eq!(parse_value("1,234.5"), None);
        assert_eq!(parse_value("NaN"), None);
    }

    #[test]
    fn test_wide_to_long_shape_and_left_join() {
        let mapper = SignalMapper::new().unwrap();
        let catalog = vec![mapper.catalog_entry("[P1] Inverter 1 Array output power (kW)")];
        let t0 = UTC.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let wide = WideTable {
            timestamps: vec![Some(t0), Some(t0 + chrono::Duration::minutes(5)), None],
            columns: vec![
                WideColumn {
                    name: "[P1] Inverter 1 Array output power (kW)".to_string(),
                    cells: vec![Some("10,5".to_string()), Some("bad".to_string()), Some("3".to_string())],
                },
                WideColumn {
                    name: "Extra column".to_string(),
                    cells: vec![Some("1".to_string()), None],
                },
            ],
        };

        let long = wide_to_long(&wide, &catalog);
        assert_eq!(long.len(), 6);

        assert_eq!(long.records[0].value, Some(10.5));
        assert_eq!(long.records[0].signal.canonical_signal, "ac_power_kw");
        assert_eq!(long.records[1].value, None);
        assert_eq!(long.records[2].ts, None);
        assert_eq!(long.records[2].value, Some(3.0));

        let extra = &long.records[3];
        assert_eq!(extra.raw_column_name(), "Extra column");
        assert!(!extra.signal.mapped);
        assert_eq!(extra.signal.component_type, ComponentType::Unknown);
        assert_eq!(extra.signal.canonical_signal, "unmapped::Extra column");
        // short column
        assert_eq!(long.records[5].value, None);
    }
}
