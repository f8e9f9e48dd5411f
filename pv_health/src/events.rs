use crate::models::{EventLabel, LabeledSeries, PlantTimeSeries};
use crate::timegrid::Timestamp;
use anyhow::{Context, Result};
use chrono::Duration;
use regex::Regex;
use std::collections::BTreeMap;

/// Category rules on the event description, first match wins.
const CATEGORY_RULES: &[(&str, EventLabel)] = &[
    (r"(?i)curtail|setpoint|limit|active power limit", EventLabel::Curtailment),
    (
        r"(?i)grid|utility|voltage ride|frequency ride|disconnection",
        EventLabel::GridOutage,
    ),
    (r"(?i)maint|service|inspection|planned", EventLabel::PlannedMaintenance),
    (r"(?i)inverter|fault|trip|error|alarm", EventLabel::InverterFault),
    (r"(?i)comms|communication|no data|offline|scada", EventLabel::CommsData),
];

/// One row of the raw event log, as loaded.
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub duration: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub severity: Option<String>,
    pub state: Option<String>,
}

/// Event with a resolved plant, a closed interval and a category.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub plant_name: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub category: EventLabel,
    pub description: Option<String>,
    pub severity: Option<String>,
    pub state: Option<String>,
    pub source: Option<String>,
}

/// Merged interval of one (plant, category).
#[derive(Debug, Clone, PartialEq)]
pub struct EventInterval {
    pub plant_name: String,
    pub category: EventLabel,
    pub start: Timestamp,
    pub end: Timestamp,
}

pub struct EventNormalizer {
    rules: Vec<(Regex, EventLabel)>,
    bracket_re: Regex,
    duration_re: Regex,
}

impl EventNormalizer {
    pub fn new() -> Result<Self> {
        let rules = CATEGORY_RULES
            .iter()
            .map(|(pattern, label)| {
                Regex::new(pattern)
                    .map(|re| (re, *label))
                    .with_context(|| format!("compiling event rule {}", pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            bracket_re: Regex::new(r"\[(.+?)\]")?,
            duration_re: Regex::new(
                r"^(?:(?P<days>\d+)\s*days?)?\s*(?:(?P<h>\d+):(?P<m>\d{1,2}):(?P<s>\d{1,2}(?:\.\d+)?))?$",
            )?,
        })
    }

    pub fn categorize(&self, description: Option<&str>) -> EventLabel {
        let text = description.unwrap_or("");
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map_or(EventLabel::OtherUnknown, |(_, label)| *label)
    }

    /// Accepts plain seconds (`"5400"`), `HH:MM:SS` and `N days HH:MM:SS`.
    pub fn parse_duration(&self, text: &str) -> Option<Duration> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Ok(secs) = text.parse::<f64>() {
            return millis(secs);
        }

        let caps = self.duration_re.captures(text)?;
        if caps.name("days").is_none() && caps.name("h").is_none() {
            return None;
        }
        let days: i64 = caps.name("days").map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let hours: i64 = caps.name("h").map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let minutes: i64 = caps.name("m").map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let seconds: f64 = caps.name("s").map_or(Ok(0.0), |m| m.as_str().parse()).ok()?;
        Duration::try_days(days)?
            .checked_add(&Duration::try_hours(hours)?)?
            .checked_add(&Duration::try_minutes(minutes)?)?
            .checked_add(&millis(seconds)?)
    }

    /// Plant from a `[plant]` tag in the source text, else the first known
    /// plant name the text contains.
    pub fn infer_plant(&self, source: Option<&str>, plants: &[String]) -> Option<String> {
        let source = source?;
        if let Some(caps) = self.bracket_re.captures(source) {
            return caps.get(1).map(|m| m.as_str().trim().to_string());
        }
        plants
            .iter()
            .find(|p| !p.is_empty() && source.contains(p.as_str()))
            .cloned()
    }

    /// Resolve end times, categories and plants. Events without a plant or a
    /// complete, ordered interval are dropped.
    pub fn normalize_events(&self, raw: &[RawEvent], plants: &[String]) -> Vec<NormalizedEvent> {
        let events: Vec<NormalizedEvent> = raw
            .iter()
            .filter_map(|ev| {
                let start = ev.start?;
                let end = match ev.end {
                    Some(end) => end,
                    None => {
                        let text = ev.duration.as_deref()?;
                        let end = self
                            .parse_duration(text)
                            .and_then(|d| start.checked_add_signed(d));
                        if end.is_none() {
                            log::warn!("Dropping event at {}: unusable duration '{}'", start, text);
                        }
                        end?
                    }
                };
                if end < start {
                    return None;
                }
                let plant_name = self.infer_plant(ev.source.as_deref(), plants)?;
                Some(NormalizedEvent {
                    plant_name,
                    start,
                    end,
                    category: self.categorize(ev.description.as_deref()),
                    description: ev.description.clone(),
                    severity: ev.severity.clone(),
                    state: ev.state.clone(),
                    source: ev.source.clone(),
                })
            })
            .collect();

        if events.len() < raw.len() {
            log::warn!(
                "Dropped {} of {} events without plant or valid interval",
                raw.len() - events.len(),
                raw.len()
            );
        }
        events
    }
}

/// Seconds as a millisecond-precision duration; `None` when not representable.
fn millis(secs: f64) -> Option<Duration> {
    let ms = (secs * 1000.0).round();
    if !ms.is_finite() || ms.abs() >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(ms as i64)
}

/// Merge overlapping (or touching) intervals within each (plant, category).
pub fn merge_overlapping_events(events: &[NormalizedEvent]) -> Vec<EventInterval> {
    let mut groups: BTreeMap<(&str, EventLabel), Vec<(Timestamp, Timestamp)>> = BTreeMap::new();
    for ev in events {
        groups
            .entry((ev.plant_name.as_str(), ev.category))
            .or_default()
            .push((ev.start, ev.end));
    }

    let mut merged = Vec::new();
    for ((plant, category), mut spans) in groups {
        spans.sort();
        let mut current: Option<(Timestamp, Timestamp)> = None;
        for (s, e) in spans {
            current = match current {
                Some((cs, ce)) if s <= ce => Some((cs, ce.max(e))),
                Some((cs, ce)) => {
                    merged.push(EventInterval {
                        plant_name: plant.to_string(),
                        category,
                        start: cs,
                        end: ce,
                    });
                    Some((s, e))
                }
                None => Some((s, e)),
            };
        }
        if let Some((cs, ce)) = current {
            merged.push(EventInterval {
                plant_name: plant.to_string(),
                category,
                start: cs,
                end: ce,
            });
        }
    }
    merged
}

/// Label every timestamp of a plant series with the highest-priority event
/// category covering it (bounds inclusive), or `none`.
pub fn label_series(series: PlantTimeSeries, intervals: &[EventInterval], plant: &str) -> LabeledSeries {
    let own: Vec<&EventInterval> = intervals.iter().filter(|iv| iv.plant_name == plant).collect();
    let event_label = series
        .index
        .iter()
        .map(|ts| {
            EventLabel::CATEGORIES
                .iter()
                .copied()
                .find(|cat| {
                    own.iter()
                        .any(|iv| iv.category == *cat && iv.start <= *ts && *ts <= iv.end)
                })
                .unwrap_or(EventLabel::None)
        })
        .collect();
    LabeledSeries { series, event_label }
}
