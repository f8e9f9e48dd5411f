use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use pv_health::timegrid::localize;
use pv_health::{PipelineConfig, PlantMetadata, RawEvent, Timestamp, WideColumn, WideTable};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Naive layouts tried in order when no timestamp format is configured.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

/// Layouts carrying a UTC offset.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%dT%H:%M:%S%z"];

/// A raw text table: header names and column-major cells.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub columns: Vec<Vec<Option<String>>>,
}

impl RawTable {
    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn column(&self, name: &str) -> Option<&[Option<String>]> {
        self.headers
            .iter()
            .position(|h| h == name)
            .map(|i| self.columns[i].as_slice())
    }
}

/// `;` when the first line contains one, else `,`.
pub fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut first_line = String::new();
    BufReader::new(file).read_line(&mut first_line)?;
    Ok(if first_line.contains(';') { b';' } else { b',' })
}

/// Read a delimited text table, keeping every cell as text. Empty cells are null.
pub fn read_table(path: &Path) -> Result<RawTable> {
    let delimiter = detect_delimiter(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    let mut columns: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];

    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{} record {}", path.display(), line + 1))?;
        for (i, column) in columns.iter_mut().enumerate() {
            let cell = record.get(i).map(str::trim).filter(|c| !c.is_empty());
            column.push(cell.map(str::to_string));
        }
    }

    Ok(RawTable { headers, columns })
}

/// Parses timestamp text into zone-aware instants.
pub struct TimestampParser {
    tz: Tz,
    format: Option<String>,
}

impl TimestampParser {
    pub fn new(tz: Tz, format: Option<String>) -> Self {
        Self { tz, format }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(cfg.timezone, cfg.timestamp_format.clone())
    }

    /// Offset-carrying text is converted to the zone; naive text is localized
    /// (nonexistent times shift forward, ambiguous times give `None`).
    pub fn parse(&self, text: &str) -> Option<Timestamp> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        if let Some(fmt) = &self.format {
            if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
                return Some(dt.with_timezone(&self.tz));
            }
            return NaiveDateTime::parse_from_str(text, fmt)
                .ok()
                .and_then(|naive| localize(self.tz, &naive));
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&self.tz));
        }
        for fmt in OFFSET_FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
                return Some(dt.with_timezone(&self.tz));
            }
        }
        for fmt in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
                return localize(self.tz, &naive);
            }
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|naive| localize(self.tz, &naive))
    }
}

/// Load one wide SCADA file: the configured timestamp column plus one column per header.
pub fn load_wide_table(path: &Path, cfg: &PipelineConfig) -> Result<WideTable> {
    let raw = read_table(path)?;
    let ts_index = match raw.headers.iter().position(|h| *h == cfg.timestamp_col) {
        Some(i) => i,
        None => bail!(
            "timestamp column '{}' not found in {}",
            cfg.timestamp_col,
            path.display()
        ),
    };

    let parser = TimestampParser::from_config(cfg);
    let timestamps: Vec<Option<Timestamp>> = raw.columns[ts_index]
        .iter()
        .map(|cell| cell.as_deref().and_then(|c| parser.parse(c)))
        .collect();
    let unparsed = timestamps.iter().filter(|t| t.is_none()).count();
    if unparsed > 0 {
        log::warn!("{}: {} timestamps could not be parsed", path.display(), unparsed);
    }

    let columns = raw
        .headers
        .iter()
        .zip(raw.columns.iter())
        .enumerate()
        .filter(|(i, _)| *i != ts_index)
        .map(|(_, (name, cells))| WideColumn {
            name: name.clone(),
            cells: cells.clone(),
        })
        .collect();

    Ok(WideTable { timestamps, columns })
}

/// Load the raw event log (`Start Date`, `End Date`, `Duration`, `Description`,
/// `Source`, `Severity`, `State`; every column optional).
pub fn load_events(path: &Path, cfg: &PipelineConfig) -> Result<Vec<RawEvent>> {
    let raw = read_table(path)?;
    let parser = TimestampParser::from_config(cfg);
    let cell = |name: &str, row: usize| -> Option<String> {
        raw.column(name).and_then(|c| c.get(row).cloned().flatten())
    };

    let events = (0..raw.n_rows())
        .map(|row| RawEvent {
            start: cell("Start Date", row).and_then(|s| parser.parse(&s)),
            end: cell("End Date", row).and_then(|s| parser.parse(&s)),
            duration: cell("Duration", row),
            description: cell("Description", row),
            source: cell("Source", row),
            severity: cell("Severity", row),
            state: cell("State", row),
        })
        .collect::<Vec<_>>();
    log::info!("Loaded {} raw events from {}", events.len(), path.display());
    Ok(events)
}

/// Load plant metadata; requires a `plant_name` column.
pub fn load_metadata(path: &Path) -> Result<Vec<PlantMetadata>> {
    let raw = read_table(path)?;
    let Some(plant_col) = raw.headers.iter().position(|h| h == "plant_name") else {
        bail!("metadata {} has no plant_name column", path.display());
    };

    let rows = (0..raw.n_rows())
        .filter_map(|row| {
            let plant_name = raw.columns[plant_col][row].clone()?;
            let values: BTreeMap<String, String> = raw
                .headers
                .iter()
                .zip(raw.columns.iter())
                .filter_map(|(h, c)| Some((h.clone(), c[row].clone()?)))
                .collect();
            Some(PlantMetadata { plant_name, values })
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Athens;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_timestamp_parsing_and_dst() {
        let parser = TimestampParser::new(Athens, None);
        assert_eq!(
            parser.parse("2024-06-01 12:00:00"),
            Some(Athens.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parser.parse("2024-06-01T09:00:00Z"),
            Some(Athens.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parser.parse("01/06/2024 12:00"),
            Some(Athens.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
        );
        // spring-forward gap: 03:30 does not exist on 2024-03-31 in Athens
        let shifted = parser.parse("2024-03-31 03:30:00").unwrap();
        assert_eq!(shifted, Athens.with_ymd_and_hms(2024, 3, 31, 4, 0, 0).unwrap());
        // fall-back overlap is ambiguous
        assert_eq!(parser.parse("2024-10-27 03:30:00"), None);
        assert_eq!(parser.parse("not a date"), None);
    }

    #[test]
    fn test_configured_format() {
        let parser = TimestampParser::new(chrono_tz::UTC, Some("%d-%m-%Y %H.%M".to_string()));
        assert_eq!(
            parser.parse("15-01-2024 08.05"),
            Some(chrono_tz::UTC.with_ymd_and_hms(2024, 1, 15, 8, 5, 0).unwrap())
        );
        assert_eq!(parser.parse("2024-01-15 08:05:00"), None);
    }

    #[test]
    fn test_load_semicolon_wide_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "scada.csv",
            "Timestamp;[P1] Array 1 Array output power (kW);[P1] Array 1 Total Irradiance (W/m2)\n\
             2024-06-01 12:00:00;10,5;800\n\
             2024-06-01 12:05:00;;810\n\
             garbage;3;\n",
        );
        let cfg = PipelineConfig::default();
        let wide = load_wide_table(&path, &cfg).unwrap();
        assert_eq!(wide.n_rows(), 3);
        assert_eq!(wide.columns.len(), 2);
        assert_eq!(wide.columns[0].cells[0].as_deref(), Some("10,5"));
        assert_eq!(wide.columns[0].cells[1], None);
        assert!(wide.timestamps[2].is_none());
        assert_eq!(wide.columns[1].cells[2], None);
    }

    #[test]
    fn test_missing_timestamp_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "scada.csv", "Time,a\n2024-01-01 00:00:00,1\n");
        assert!(load_wide_table(&path, &PipelineConfig::default()).is_err());
    }

    #[test]
    fn test_load_events_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let events = write_file(
            &dir,
            "events.csv",
            "Start Date,End Date,Duration,Description,Source\n\
             2024-06-01 10:00:00,,01:00:00,Inverter trip,[P1] INV 2\n",
        );
        let cfg = PipelineConfig::default();
        let raw = load_events(&events, &cfg).unwrap();
        assert_eq!(raw.len(), 1);
        assert!(raw[0].start.is_some());
        assert!(raw[0].end.is_none());
        assert_eq!(raw[0].duration.as_deref(), Some("01:00:00"));
        assert_eq!(raw[0].severity, None);

        let meta = write_file(&dir, "meta.csv", "plant_name;DC_kWp\nP1;1200,5\n;99\n");
        let rows = load_metadata(&meta).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values.get("DC_kWp").map(String::as_str), Some("1200,5"));
    }
}
