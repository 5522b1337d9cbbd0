//! Human-like send scheduling. The result is a `send_after` hint stored on the
//! queue item; the rate limiter remains the only hard gate.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Timelike, Utc,
};
use rand::Rng;

use crate::ai::Priority;
use crate::config::PacingSettings;

/// Base delay in seconds per analysis category.
pub const CATEGORY_BASE_DELAYS: &[(&str, i64)] = &[
    ("admissions", 300),
    ("scholarships", 420),
    ("fees", 360),
    ("visa", 600),
    ("documents", 480),
    ("general", 540),
];

pub const DEFAULT_BASE_DELAY_SECS: i64 = 600;

const MAX_QUIET_SKIPS: usize = 16;

pub fn base_delay_secs(category: &str) -> i64 {
    let category = category.trim();
    CATEGORY_BASE_DELAYS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(category))
        .map(|(_, secs)| *secs)
        .unwrap_or(DEFAULT_BASE_DELAY_SECS)
}

pub fn priority_factor(priority: Priority) -> f64 {
    match priority {
        Priority::High => 0.5,
        Priority::Medium => 1.0,
        Priority::Low => 1.5,
    }
}

/// Less certain answers wait longer, up to 1.5x at zero confidence.
pub fn confidence_factor(confidence: f64) -> f64 {
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    1.0 + (1.0 - confidence) * 0.5
}

/// `unit` is a sample in `[-1, 1]`; the result stays within `ratio` of `secs`.
pub fn apply_jitter(secs: f64, ratio: f64, unit: f64) -> f64 {
    secs * (1.0 + ratio.abs() * unit.clamp(-1.0, 1.0))
}

pub fn compute_delay<R: Rng + ?Sized>(
    category: &str,
    priority: Priority,
    confidence: f64,
    settings: &PacingSettings,
    rng: &mut R,
) -> Duration {
    let scaled = base_delay_secs(category) as f64
        * priority_factor(priority)
        * confidence_factor(confidence);
    let jittered = apply_jitter(scaled, settings.jitter_ratio, rng.random_range(-1.0..=1.0));
    let floor = settings.floor_secs.min(settings.ceiling_secs);
    let secs = (jittered.round() as i64).clamp(floor, settings.ceiling_secs);
    Duration::seconds(secs)
}

fn local_offset(settings: &PacingSettings) -> FixedOffset {
    FixedOffset::east_opt(settings.utc_offset_hours.saturating_mul(3_600))
        .unwrap_or_else(|| Utc.fix())
}

fn in_nightly_window(hour: u32, settings: &PacingSettings) -> bool {
    let (start, end) = (settings.quiet_start_hour, settings.quiet_end_hour);
    if start == end {
        false
    } else if start > end {
        hour >= start || hour < end
    } else {
        hour >= start && hour < end
    }
}

pub fn is_quiet_time(at: DateTime<Utc>, settings: &PacingSettings) -> bool {
    let local = at.with_timezone(&local_offset(settings));
    settings
        .quiet_weekday
        .is_some_and(|weekday| local.weekday() == weekday)
        || in_nightly_window(local.hour(), settings)
}

/// Earliest instant at or after `candidate` outside every quiet window.
pub fn next_allowed_send(candidate: DateTime<Utc>, settings: &PacingSettings) -> DateTime<Utc> {
    let offset = local_offset(settings);
    let mut at = candidate;

    for _ in 0..MAX_QUIET_SKIPS {
        if !is_quiet_time(at, settings) {
            return at;
        }
        let local = at.with_timezone(&offset);
        let date = local.date_naive();

        let next_local = if settings
            .quiet_weekday
            .is_some_and(|weekday| local.weekday() == weekday)
        {
            date.succ_opt().map(|day| day.and_time(NaiveTime::MIN))
        } else {
            let end = NaiveTime::from_hms_opt(settings.quiet_end_hour, 0, 0);
            match end {
                Some(end) if local.hour() < settings.quiet_end_hour => Some(date.and_time(end)),
                Some(end) => date.succ_opt().map(|day| day.and_time(end)),
                None => None,
            }
        };

        let Some(next) = next_local
            .and_then(|naive| offset.from_local_datetime(&naive).single())
            .map(|value| value.with_timezone(&Utc))
        else {
            return at;
        };
        if next <= at {
            return at;
        }
        at = next;
    }
    at
}

pub fn schedule_send<R: Rng + ?Sized>(
    now: DateTime<Utc>,
    category: &str,
    priority: Priority,
    confidence: f64,
    settings: &PacingSettings,
    rng: &mut R,
) -> DateTime<Utc> {
    next_allowed_send(
        now + compute_delay(category, priority, confidence, settings, rng),
        settings,
    )
}
