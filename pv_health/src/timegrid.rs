use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;

/// Timezone-aware instant used throughout the pipeline.
pub type Timestamp = DateTime<Tz>;

/// Parse a resampling rule such as "5min", "15min", "1h", "30s" or "1d".
pub fn parse_freq(rule: &str) -> Result<Duration> {
    let rule = rule.trim();
    let split = rule
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rule.len());
    let (num, unit) = rule.split_at(split);
    let n: i64 = if num.is_empty() {
        1
    } else {
        num.parse()
            .with_context(|| format!("invalid frequency count in '{}'", rule))?
    };

    let step = match unit.trim().to_lowercase().as_str() {
        "s" | "sec" | "secs" => Duration::try_seconds(n),
        "t" | "m" | "min" | "mins" => Duration::try_minutes(n),
        "h" | "hour" | "hours" => Duration::try_hours(n),
        "d" | "day" | "days" => Duration::try_days(n),
        other => bail!("unsupported frequency unit '{}' in '{}'", other, rule),
    };
    let Some(step) = step else {
        bail!("frequency '{}' is out of range", rule);
    };

    if step <= Duration::zero() {
        bail!("frequency '{}' must be positive", rule);
    }
    Ok(step)
}

/// Floor a timestamp onto the grid of `step`, aligned to UTC epoch multiples
/// (not local clock time, which differs for zones with sub-hour offsets).
pub fn floor_to_grid(ts: Timestamp, step: Duration) -> Timestamp {
    let step_s = step.num_seconds().max(1);
    let rem = ts.timestamp().rem_euclid(step_s);
    ts - Duration::seconds(rem) - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
}

/// Localize a naive wall-clock time: nonexistent times are shifted forward past
/// the DST gap, ambiguous times have no answer.
pub fn localize(tz: Tz, naive: &NaiveDateTime) -> Option<Timestamp> {
    match tz.from_local_datetime(naive) {
        LocalResult::Single(ts) => Some(ts),
        LocalResult::Ambiguous(_, _) => None,
        LocalResult::None => shift_forward(tz, naive),
    }
}

fn shift_forward(tz: Tz, naive: &NaiveDateTime) -> Option<Timestamp> {
    let minute = naive.with_second(0)?.with_nanosecond(0)?;
    // DST gaps never exceed a few hours
    (1..=240).find_map(|m| match tz.from_local_datetime(&(minute + Duration::minutes(m))) {
        LocalResult::Single(ts) => Some(ts),
        LocalResult::Ambiguous(early, _) => Some(early),
        LocalResult::None => None,
    })
}

/// Local midnight of the calendar day containing `ts`.
pub fn local_midnight(ts: Timestamp) -> Timestamp {
    let tz = ts.timezone();
    let naive = ts.date_naive().and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(early, _) => early,
        LocalResult::None => shift_forward(tz, &naive).unwrap_or(ts),
    }
}

/// Number of whole grid steps that fit in `span`.
pub fn steps_in(span: Duration, step: Duration) -> usize {
    let step_s = step.num_seconds();
    if step_s <= 0 {
        return 0;
    }
    (span.num_seconds() / step_s).max(0) as usize
}
