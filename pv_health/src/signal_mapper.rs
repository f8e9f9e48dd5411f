use crate::issues::DataIssue;
use crate::models::{ComponentType, SignalCatalogEntry};
use anyhow::{Context, Result};
use regex::Regex;

/// Raw unit spellings and their normalized form. Units not listed pass through.
const UNIT_SYNONYMS: &[(&str, &str)] = &[
    ("W*m^-2", "W/m^2"),
    ("W*m-2", "W/m^2"),
    ("W/m2", "W/m^2"),
    ("Vac", "V"),
    ("Vdc", "V"),
    ("kVAr", "kvar"),
    ("kVA", "kva"),
    ("C", "°C"),
    ("Ohm", "ohm"),
];

/// Ordered (pattern, canonical template) rules. The first match wins, so the
/// more specific patterns must stay above the general ones.
const CANONICAL_RULES: &[(&str, &str)] = &[
    (r"(?i)\bCumulative\b.*\benergy\b.*\bmeasured\b", "energy_kwh_counter_measured"),
    (r"(?i)\bCumulative\b.*\benergy\b", "energy_kwh_counter"),
    (r"(?i)\bArray output energy\b", "energy_kwh_interval"),
    (r"(?i)\bPanel group output energy\b", "energy_kwh_interval"),
    (r"(?i)\bArray active output power\b", "ac_power_kw"),
    (r"(?i)\bArray output power\b", "ac_power_kw"),
    (r"(?i)\bPanel group output power\b", "ac_power_kw"),
    (r"(?i)\bArray apparent output power\b", "ac_power_kva"),
    (r"(?i)\bArray reactive output power\b", "q_kvar"),
    (r"(?i)\bTotal power factor\b", "pf"),
    (r"(?i)\bTotal Irradiance\b", "poa_irradiance_wm2"),
    (r"(?i)\bModule Temperature\b", "tmod_c"),
    (r"(?i)\bAmbient Temperature\b", "tamb_c"),
    (r"(?i)\bInternal temperature\b", "inv_internal_temp_c"),
    (r"(?i)\bInverter insulation resistance\b", "insulation_resistance_ohm"),
    (r"(?i)\bInverter leakage current\b", "leakage_current_a"),
    (r"(?i)\bMaintenance performance ratio\b", "vendor_pr_pct"),
    (r"(?i)\bAC voltage unbalance\b", "ac_voltage_unbalance_pct"),
    (r"(?i)\bAC output frequency error\b", "ac_frequency_error_hz"),
    (r"(?i)\bArray output frequency\b", "ac_frequency_hz"),
    (r"(?i)\bArray output current of phase (?P<phase>L[123])\b", "ac_current_a_{phase}"),
    (r"(?i)\bArray output current\b", "ac_current_a"),
    (r"(?i)\bN phase AC output current\b", "ac_current_a_N"),
    (r"(?i)\bAverage strings current\b", "avg_string_current_a"),
    (r"(?i)\bArray output voltage of phase (?P<phase>L[123])\b", "ac_voltage_v_{phase}"),
    (r"(?i)\bArray output voltage\b", "ac_voltage_v"),
    (r"(?i)\bPanel group output voltage\b", "dc_voltage_v"),
    (r"(?i)\bDC Link Voltage\b", "dc_link_voltage_v"),
    (r"(?i)\bDC Link Current\b", "dc_link_current_a"),
    (r"(?i)\bNominal output power\b", "nameplate_kwp"),
    (r"(?i)\bPanel area\b", "panel_area_m2"),
];

/// Unit each canonical signal is expected to carry.
pub fn expected_unit(canonical_signal: &str) -> Option<&'static str> {
    let unit = match canonical_signal {
        "energy_kwh_counter_measured" | "energy_kwh_counter" | "energy_kwh_interval" => "kWh",
        "ac_power_kw" => "kW",
        "ac_power_kva" => "kva",
        "q_kvar" => "kvar",
        "pf" => "-",
        "poa_irradiance_wm2" => "W/m^2",
        "tmod_c" | "tamb_c" | "inv_internal_temp_c" => "°C",
        "insulation_resistance_ohm" => "ohm",
        "vendor_pr_pct" | "ac_voltage_unbalance_pct" => "%",
        "ac_frequency_error_hz" | "ac_frequency_hz" => "Hz",
        "leakage_current_a" | "ac_current_a" | "ac_current_a_L1" | "ac_current_a_L2"
        | "ac_current_a_L3" | "ac_current_a_N" | "avg_string_current_a" | "dc_link_current_a" => "A",
        "ac_voltage_v" | "ac_voltage_v_L1" | "ac_voltage_v_L2" | "ac_voltage_v_L3"
        | "dc_voltage_v" | "dc_link_voltage_v" => "V",
        "nameplate_kwp" => "kWp",
        "panel_area_m2" => "m^2",
        _ => return None,
    };
    Some(unit)
}

/// Normalize a raw unit string through the synonym table.
pub fn normalize_unit(unit: Option<&str>) -> Option<String> {
    let u = unit?.trim();
    let normalized = UNIT_SYNONYMS
        .iter()
        .find(|(raw, _)| *raw == u)
        .map(|(_, norm)| *norm)
        .unwrap_or(u);
    Some(normalized.to_string())
}

/// Header split into its parts: `[plant] <component> <signal> (unit)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedHeader {
    pub plant_name: Option<String>,
    pub component_type: ComponentType,
    pub component_id: String,
    pub raw_signal_name: String,
    pub unit_raw: Option<String>,
}

/// Outcome of matching a raw signal name against the canonical rules.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMapping {
    pub canonical_signal: String,
    pub unit: Option<String>,
    pub mapped: bool,
    pub pattern: Option<String>,
    pub expected_unit: Option<String>,
    pub unit_ok: Option<bool>,
}

struct CanonicalRule {
    pattern: &'static str,
    regex: Regex,
    template: &'static str,
}

pub struct SignalMapper {
    header_re: Regex,
    unit_re: Regex,
    component_res: Vec<(ComponentType, Regex)>,
    rules: Vec<CanonicalRule>,
}

impl SignalMapper {
    /// Compile the header grammar and the canonical rule table.
    pub fn new() -> Result<Self> {
        let header_re = Regex::new(r"^\[(?P<plant>.+?)\]\s+(?P<rest>.+?)$")?;
        let unit_re = Regex::new(r"\((?P<unit>[^)]+)\)\s*$")?;

        // Array Group must be tried before Array
        let component_res = vec![
            (
                ComponentType::ArrayGroup,
                Regex::new(r"(?i)^(Array Group)\s+(?P<id>.+?)\s+(?P<sig>.+)$")?,
            ),
            (
                ComponentType::Array,
                Regex::new(r"(?i)^(Array)\s+(?P<id>\d+)\s+(?P<sig>.+)$")?,
            ),
            (
                ComponentType::Inverter,
                Regex::new(r"(?i)^(Inverter)\s+(?P<id>\d+)\s+(?P<sig>.+)$")?,
            ),
        ];

        let rules = CANONICAL_RULES
            .iter()
            .map(|(pattern, template)| {
                Ok(CanonicalRule {
                    pattern,
                    regex: Regex::new(pattern)
                        .with_context(|| format!("compiling signal pattern {}", pattern))?,
                    template,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            header_re,
            unit_re,
            component_res,
            rules,
        })
    }

    /// Split a raw column header into plant, component, signal and unit.
    pub fn parse_header(&self, raw_column: &str) -> ParsedHeader {
        let (plant_name, rest) = match self.header_re.captures(raw_column) {
            Some(caps) => (
                caps.name("plant").map(|m| m.as_str().trim().to_string()),
                caps.name("rest").map_or(raw_column, |m| m.as_str()).trim(),
            ),
            None => (None, raw_column.trim()),
        };

        let (unit_raw, without_unit) = match self.unit_re.captures(rest) {
            Some(caps) => {
                let start = caps.get(0).map_or(rest.len(), |m| m.start());
                (
                    caps.name("unit").map(|m| m.as_str().trim().to_string()),
                    rest[..start].trim(),
                )
            }
            None => (None, rest),
        };

        for (component_type, re) in &self.component_res {
            if let Some(caps) = re.captures(without_unit) {
                if let (Some(id), Some(sig)) = (caps.name("id"), caps.name("sig")) {
                    return ParsedHeader {
                        plant_name,
                        component_type: *component_type,
                        component_id: id.as_str().trim().to_string(),
                        raw_signal_name: sig.as_str().trim().to_string(),
                        unit_raw,
                    };
                }
            }
        }

        ParsedHeader {
            plant_name,
            component_type: ComponentType::Unknown,
            component_id: "unknown".to_string(),
            raw_signal_name: without_unit.trim().to_string(),
            unit_raw,
        }
    }

    /// Map a raw signal name (and its raw unit) onto the canonical taxonomy.
    pub fn map_signal(&self, raw_signal: &str, unit_raw: Option<&str>) -> SignalMapping {
        let unit = normalize_unit(unit_raw);
        let rs = raw_signal.trim();

        for rule in &self.rules {
            if let Some(caps) = rule.regex.captures(rs) {
                let canonical = match caps.name("phase") {
                    Some(phase) => rule.template.replace("{phase}", phase.as_str()),
                    None => rule.template.to_string(),
                };
                let expected = expected_unit(&canonical).map(str::to_string);
                let unit_ok = match (&expected, &unit) {
                    (Some(e), Some(u)) => e == u,
                    _ => true,
                };
                return SignalMapping {
                    canonical_signal: canonical,
                    unit,
                    mapped: true,
                    pattern: Some(rule.pattern.to_string()),
                    expected_unit: expected,
                    unit_ok: Some(unit_ok),
                };
            }
        }

        SignalMapping {
            canonical_signal: format!("unmapped::{}", rs),
            unit,
            mapped: false,
            pattern: None,
            expected_unit: None,
            unit_ok: None,
        }
    }

    /// Full catalog entry for one raw column header.
    pub fn catalog_entry(&self, raw_column: &str) -> SignalCatalogEntry {
        let header = self.parse_header(raw_column);
        let mapping = self.map_signal(&header.raw_signal_name, header.unit_raw.as_deref());
        SignalCatalogEntry {
            raw_column_name: raw_column.to_string(),
            plant_name: header.plant_name,
            component_type: header.component_type,
            component_id: header.component_id,
            raw_signal_name: header.raw_signal_name,
            unit_raw: header.unit_raw,
            unit: mapping.unit,
            canonical_signal: mapping.canonical_signal,
            mapped: mapping.mapped,
            pattern: mapping.pattern,
            expected_unit: mapping.expected_unit,
            unit_ok: mapping.unit_ok,
        }
    }

    /// Build the signal catalog for every column except the timestamp column.
    pub fn build_catalog(&self, columns: &[String], timestamp_col: &str) -> Vec<SignalCatalogEntry> {
        let catalog: Vec<SignalCatalogEntry> = columns
            .iter()
            .filter(|c| c.as_str() != timestamp_col)
            .map(|c| self.catalog_entry(c))
            .collect();

        let mapped = catalog.iter().filter(|e| e.mapped).count();
        log::info!(
            "Signal catalog: {} columns, {} mapped, {} unmapped",
            catalog.len(),
            mapped,
            catalog.len() - mapped
        );
        catalog
    }
}

/// Catalog rows that need manual review: unmapped signals and unit mismatches.
pub fn catalog_issues(catalog: &[SignalCatalogEntry]) -> Vec<DataIssue> {
    let mut issues = Vec::new();
    for entry in catalog {
        if !entry.mapped {
            issues.push(DataIssue::MappingMiss {
                column: entry.raw_column_name.clone(),
                raw_signal: entry.raw_signal_name.clone(),
            });
        } else if entry.unit_ok == Some(false) {
            issues.push(DataIssue::UnitMismatch {
                column: entry.raw_column_name.clone(),
                observed: entry.unit.clone().unwrap_or_default(),
                expected: entry.expected_unit.clone().unwrap_or_default(),
            });
        }
    }
    issues
}
