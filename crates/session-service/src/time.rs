//! Clock and time utilities.
//!
//! Pure functions over instants. Callers pass `now` explicitly so every
//! decision can be evaluated against a fixed reference in tests.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

/// Reminder fires this long before the scheduled start.
pub const REMINDER_LEAD_MINUTES: i64 = 60;

/// Fill-deadline fires this long before the scheduled start.
pub const FILL_DEADLINE_LEAD_MINUTES: i64 = 5;

/// Completion fires this long after the scheduled start.
pub const COMPLETION_AFTER_HOURS: i64 = 5;

/// The instant `minutes` before `reference`, saturating at the earliest
/// representable instant.
pub fn minutes_before(reference: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    reference
        .checked_sub_signed(Duration::minutes(minutes))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The instant `hours` after `reference`, saturating at the latest
/// representable instant.
pub fn hours_after(reference: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    reference
        .checked_add_signed(Duration::hours(hours))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whether `instant` is strictly after `now`.
pub fn is_future(instant: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    instant > now
}

/// Time remaining until `instant`, or `None` if it is not in the future.
pub fn until(instant: DateTime<Utc>, now: DateTime<Utc>) -> Option<std::time::Duration> {
    if !is_future(instant, now) {
        return None;
    }
    (instant - now).to_std().ok()
}

/// Resolve an optional IANA timezone name, falling back to `fallback`
/// for missing or unknown names.
pub fn resolve_timezone(name: Option<&str>, fallback: Tz) -> Tz {
    name.and_then(|n| n.parse::<Tz>().ok()).unwrap_or(fallback)
}

/// Whether two instants fall on the same calendar day in `tz`.
pub fn same_calendar_day(a: DateTime<Utc>, b: DateTime<Utc>, tz: Tz) -> bool {
    a.with_timezone(&tz).date_naive() == b.with_timezone(&tz).date_naive()
}

/// Human-facing rendering of `instant` in `tz`.
pub fn format_local(instant: DateTime<Utc>, tz: Tz) -> String {
    instant
        .with_timezone(&tz)
        .format("%A %B %-d, %H:%M %Z")
        .to_string()
}

/// The three timer target instants derived from a scheduled start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeline {
    pub reminder_at: DateTime<Utc>,
    pub fill_deadline_at: DateTime<Utc>,
    pub completion_at: DateTime<Utc>,
}

impl SessionTimeline {
    pub fn for_start(start: DateTime<Utc>) -> Self {
        Self {
            reminder_at: minutes_before(start, REMINDER_LEAD_MINUTES),
            fill_deadline_at: minutes_before(start, FILL_DEADLINE_LEAD_MINUTES),
            completion_at: hours_after(start, COMPLETION_AFTER_HOURS),
        }
    }
}
